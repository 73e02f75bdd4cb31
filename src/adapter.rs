//! Typed access to one storage area.
//!
//! [`StorageAdapter`] is the only place where binding values cross into
//! JSON. It adds no retries and no caching: a backend failure comes back
//! exactly as the backend reported it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::area::StorageArea;
use crate::backend::StorageBackend;
use crate::error::Result;

/// A backend pinned to one storage area.
#[derive(Clone)]
pub struct StorageAdapter {
    backend: Arc<dyn StorageBackend>,
    area: StorageArea,
}

impl StorageAdapter {
    pub fn new(backend: Arc<dyn StorageBackend>, area: StorageArea) -> Self {
        Self { backend, area }
    }

    pub fn area(&self) -> StorageArea {
        self.area
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Read `key`, falling back to `default` when nothing is stored.
    ///
    /// The default is handed to the backend as its query default, so a
    /// missing key resolves to it without anything being written.
    pub async fn get<T>(&self, key: &str, default: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let fallback = serde_json::to_value(default)?;
        let value = self
            .backend
            .get(self.area, key, fallback)
            .await
            .inspect_err(|e| debug!(area = %self.area, key, error = %e, "storage get failed"))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub async fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let json = serde_json::to_value(value)?;
        self.backend
            .set(self.area, key, json)
            .await
            .inspect_err(|e| debug!(area = %self.area, key, error = %e, "storage set failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::memory::{MemoryBackend, Op};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        font_size: u32,
    }

    fn defaults() -> Settings {
        Settings {
            theme: "light".to_string(),
            font_size: 12,
        }
    }

    #[tokio::test]
    async fn test_get_missing_returns_default() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = StorageAdapter::new(backend.clone(), StorageArea::Local);

        let settings = adapter.get("settings", &defaults()).await.unwrap();
        assert_eq!(settings, defaults());
        assert!(backend.is_empty(StorageArea::Local));
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = StorageAdapter::new(backend.clone(), StorageArea::Sync);

        let dark = Settings {
            theme: "dark".to_string(),
            font_size: 14,
        };
        adapter.set("settings", &dark).await.unwrap();

        assert_eq!(adapter.get("settings", &defaults()).await.unwrap(), dark);
        assert_eq!(
            backend.peek(StorageArea::Sync, "settings"),
            Some(json!({"theme": "dark", "font_size": 14}))
        );
    }

    #[tokio::test]
    async fn test_backend_error_passes_through() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = StorageAdapter::new(backend.clone(), StorageArea::Local);
        backend.fail_next(Op::Set, "quota service down");

        let err = adapter.set("settings", &defaults()).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(ref m) if m == "quota service down"));
    }

    #[tokio::test]
    async fn test_mismatched_stored_value_is_serialization_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_silently(StorageArea::Local, "settings", json!("not settings"));
        let adapter = StorageAdapter::new(backend, StorageArea::Local);

        let err = adapter.get("settings", &defaults()).await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
