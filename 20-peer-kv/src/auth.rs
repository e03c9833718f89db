//! Shared-token authentication.
//!
//! Every node in a cluster is started with the same token. Clients present it
//! on Get/Put/Delete; peers calling Replicate are trusted by membership and
//! skip the check. `Authenticate` exchanges a configured API key for that same
//! token. Nothing is issued, expired or rotated.

use std::collections::HashSet;

use crate::error::NodeError;

#[derive(Debug, Clone)]
pub struct Authenticator {
    token: String,
    api_keys: HashSet<String>,
}

impl Authenticator {
    pub fn new(token: impl Into<String>, api_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            token: token.into(),
            api_keys: api_keys
                .into_iter()
                .filter(|key| !key.is_empty())
                .collect(),
        }
    }

    /// Accepts exactly the shared token. Missing and empty tokens are rejected.
    pub fn validate(&self, token: Option<&str>) -> Result<(), NodeError> {
        match token {
            Some(token) if !token.is_empty() && token == self.token => Ok(()),
            _ => Err(NodeError::Unauthenticated),
        }
    }

    /// Returns the shared token for a known API key.
    pub fn authenticate(&self, api_key: &str) -> Result<String, NodeError> {
        if self.api_keys.contains(api_key) {
            Ok(self.token.clone())
        } else {
            Err(NodeError::Unauthenticated)
        }
    }
}
