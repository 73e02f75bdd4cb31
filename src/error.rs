//! Error types for storage and binding operations.
//!
//! Backends and the adapter return these through [`Result`]. Bindings never
//! hand them to consumers directly: they are folded into the binding's
//! `is_persistent` / `error` pair instead.

use thiserror::Error;

use crate::area::StorageArea;

/// Errors that can occur while reading or writing a storage area.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failure reported by the storage backend itself.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A write would exceed one of the area's quotas.
    #[error("quota exceeded in {area} storage: {detail}")]
    QuotaExceeded { area: StorageArea, detail: String },

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Returns true if repeating the same operation may succeed.
    ///
    /// Nothing in this crate retries on its own; this is a hint for callers
    /// deciding whether to issue another update.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Backend(_) | StorageError::Database(_) | StorageError::Io(_)
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StorageError {
    fn from(err: toml::de::Error) -> Self {
        StorageError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Backend("disk unavailable".to_string());
        assert!(err.to_string().contains("storage backend error"));
        assert!(err.to_string().contains("disk unavailable"));
    }

    #[test]
    fn test_quota_display() {
        let err = StorageError::QuotaExceeded {
            area: StorageArea::Sync,
            detail: "item is 9000 bytes, limit is 8192".to_string(),
        };
        assert!(err.to_string().contains("sync storage"));
        assert!(err.to_string().contains("limit is 8192"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StorageError::Backend("test".to_string()).is_retryable());
        assert!(StorageError::Io(std::io::Error::other("test")).is_retryable());
        assert!(!StorageError::InvalidKey("test".to_string()).is_retryable());
        assert!(!StorageError::Serialization("test".to_string()).is_retryable());
        assert!(!StorageError::QuotaExceeded {
            area: StorageArea::Local,
            detail: "test".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_from_serde_json() {
        let err: StorageError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
