//! Bearer-token authentication.
//!
//! Every RPC must carry `Authorization: Bearer <token>`. The token is
//! compared in constant time against the configured allowlist; a match
//! injects the mapped identity into the request extensions.

use std::sync::Arc;
use subtle::ConstantTimeEq;
use tonic::metadata::MetadataMap;
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// The authenticated identity, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

#[derive(Clone)]
pub struct AuthInterceptor {
    /// `(identity, token)` pairs.
    keys: Arc<Vec<(String, String)>>,
}

impl AuthInterceptor {
    pub fn new(keys: Vec<(String, String)>) -> Self {
        Self { keys: Arc::new(keys) }
    }

    fn authenticate(&self, metadata: &MetadataMap) -> Result<String, Status> {
        let header = metadata
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("no authorization header provided"))?;
        let header = header
            .to_str()
            .map_err(|_| Status::unauthenticated("authorization header is not valid ascii"))?;

        // Only bearer tokens are supported.
        let token = header
            .strip_prefix("Bearer")
            .ok_or_else(|| Status::unauthenticated("authorization header is not a bearer token"))?
            .trim();

        // Scan the whole list with constant-time compares.
        let mut identity = None;
        for (id, expected) in self.keys.iter() {
            let matches: bool = expected.as_bytes().ct_eq(token.as_bytes()).into();
            if matches && identity.is_none() {
                identity = Some(id.clone());
            }
        }

        identity.ok_or_else(|| Status::unauthenticated("failed authorization"))
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let identity = self.authenticate(request.metadata())?;
        request.extensions_mut().insert(Identity(identity));
        Ok(request)
    }
}
