use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::{GateError, Result};

/// Header the edge gateway sets after validating the bearer token
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves request credentials to a user id
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String>;
}

/// Trusts the user id forwarded by the gateway
#[derive(Debug, Clone)]
pub struct HeaderAuthenticator {
    header: String,
}

impl HeaderAuthenticator {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for HeaderAuthenticator {
    fn default() -> Self {
        Self::new(USER_ID_HEADER)
    }
}

#[async_trait]
impl Authenticator for HeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String> {
        headers
            .get(self.header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                GateError::Unauthenticated("Authentication required! Please login to continue".to_string())
            })
    }
}
