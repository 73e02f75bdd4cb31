//! StorageBackend trait - the key-value engine underneath every binding.
//!
//! A backend holds one JSON value per `(area, key)` pair. Reads and writes
//! are atomic per key and complete asynchronously. Every mutation is
//! published on the backend-wide change stream, including mutations made
//! by other handles to the same storage.

use async_trait::async_trait;
use serde_json::Value;

use crate::area::StorageArea;
use crate::change::ChangeStream;
use crate::error::{Result, StorageError};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// The storage engine trait.
///
/// Implementations must be usable as `Arc<dyn StorageBackend>`; bindings
/// hold them that way.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the value under `key`, or `default` if nothing is stored.
    ///
    /// Reading never writes `default` back.
    async fn get(&self, area: StorageArea, key: &str, default: Value) -> Result<Value>;

    /// Store `value` under `key`, replacing whatever was there.
    async fn set(&self, area: StorageArea, key: &str, value: Value) -> Result<()>;

    /// Remove `key`.
    ///
    /// Returns `Ok(())` if the key was removed or didn't exist. Only an
    /// actual removal is broadcast.
    async fn remove(&self, area: StorageArea, key: &str) -> Result<()>;

    /// Remove every key in `area`, broadcasting one event for all of them.
    async fn clear(&self, area: StorageArea) -> Result<()>;

    /// List the keys stored in `area`, in lexicographic order.
    async fn keys(&self, area: StorageArea) -> Result<Vec<String>>;

    /// Bytes charged against quota for one key, or for the whole area.
    async fn bytes_in_use(&self, area: StorageArea, key: Option<&str>) -> Result<usize>;

    /// Subscribe to changes in every area.
    fn subscribe(&self) -> ChangeStream;

    /// Check if a key exists.
    async fn contains(&self, area: StorageArea, key: &str) -> Result<bool> {
        Ok(self.keys(area).await?.iter().any(|k| k == key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_valid() {
        assert!(validate_key("settings").is_ok());
        assert!(validate_key("/with/slashes").is_ok());
        assert!(validate_key("a").is_ok());
    }

    #[test]
    fn test_validate_key_empty() {
        let err = validate_key("").unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn test_validate_key_too_long() {
        let key = "a".repeat(MAX_KEY_LENGTH + 1);
        let err = validate_key(&key).unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn test_backend_is_object_safe() {
        fn assert_object_safe(_: Option<&dyn StorageBackend>) {}
        assert_object_safe(None);
    }
}
