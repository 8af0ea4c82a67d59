//! Offset pagination tokens.

use crate::error::{Result, SiloError};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Opaque continuation token for `ListVolumes`: base64url over a small JSON
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub limit: i64,
    pub offset: i64,
}

impl PageToken {
    pub fn marshal(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| SiloError::Internal(format!("failed to marshal page token: {e}")))?;
        Ok(URL_SAFE.encode(json))
    }

    pub fn unmarshal(token: &str) -> Result<Self> {
        let json = URL_SAFE
            .decode(token)
            .map_err(|_| SiloError::InvalidArgument("invalid page token".to_string()))?;
        serde_json::from_slice(&json)
            .map_err(|_| SiloError::InvalidArgument("invalid page token".to_string()))
    }
}
