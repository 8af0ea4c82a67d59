//! Self-signed TLS identity for the gRPC listener.

use anyhow::Result;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use tonic::transport::Identity;

/// Generate a fresh self-signed certificate for this process lifetime.
/// Clients are expected to skip verification (dev posture).
pub fn self_signed_identity(hostname: &str) -> Result<Identity> {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec![hostname.to_string(), "localhost".to_string()])?;
    Ok(Identity::from_pem(cert.pem(), key_pair.serialize_pem()))
}
