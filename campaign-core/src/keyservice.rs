//! Client for the key service that hands out symmetric key material for
//! protected datasets (§4.2).

use async_trait::async_trait;

use crate::error::KeyServiceError;

/// The sentinel the key service returns to mean "refused for this
/// principal" rather than "error". Distinguishing this from a transport
/// failure is what lets the engine skip one dataset instead of aborting
/// the whole catalog.
pub const KEY_DENIED_SENTINEL: &str = "0";

/// The result of a key fetch, already past the `"0"`-sentinel translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFetchResult {
    /// Key material as a hex string, ready to hand to
    /// [`crate::catalog::CatalogStore::extract_blob`].
    Granted(String),
    /// The server explicitly refused to hand out this key.
    Denied,
}

/// Fetches symmetric key material by key id.
///
/// Implementations attempt the fetch exactly once per key id per
/// `FederatedEngine::open` call (§4.2 retry policy) -- retrying on transient
/// failure is a caller concern, not this trait's.
#[async_trait]
pub trait KeyService: Send + Sync {
    async fn fetch_key(&self, key_id: &str) -> Result<KeyFetchResult, KeyServiceError>;
}

/// A `KeyService` that holds its key material in memory, for tests and for
/// single-process deployments where keys are pre-provisioned out of band.
#[derive(Debug, Default)]
pub struct StaticKeyService {
    keys: std::collections::HashMap<String, Option<String>>,
}

impl StaticKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a key id as granted with the given hex material.
    pub fn grant(mut self, key_id: impl Into<String>, key_hex: impl Into<String>) -> Self {
        self.keys.insert(key_id.into(), Some(key_hex.into()));
        self
    }

    /// Registers a key id as explicitly denied.
    pub fn deny(mut self, key_id: impl Into<String>) -> Self {
        self.keys.insert(key_id.into(), None);
        self
    }
}

#[async_trait]
impl KeyService for StaticKeyService {
    async fn fetch_key(&self, key_id: &str) -> Result<KeyFetchResult, KeyServiceError> {
        match self.keys.get(key_id) {
            Some(Some(hex)) => Ok(KeyFetchResult::Granted(hex.clone())),
            Some(None) => Ok(KeyFetchResult::Denied),
            None => Err(KeyServiceError::Unavailable(format!(
                "no such key id {key_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn granted_key_round_trips_hex() {
        let svc = StaticKeyService::new().grant("k1", "deadbeef");
        let result = svc.fetch_key("k1").await.unwrap();
        assert_eq!(result, KeyFetchResult::Granted("deadbeef".into()));
    }

    #[tokio::test]
    async fn denied_key_is_distinguished_from_error() {
        let svc = StaticKeyService::new().deny("k1");
        let result = svc.fetch_key("k1").await.unwrap();
        assert_eq!(result, KeyFetchResult::Denied);
    }

    #[tokio::test]
    async fn unknown_key_id_is_unavailable() {
        let svc = StaticKeyService::new();
        let err = svc.fetch_key("missing").await.unwrap_err();
        assert!(matches!(err, KeyServiceError::Unavailable(_)));
    }
}
