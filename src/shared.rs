//! Reusable binding definitions.
//!
//! [`SharedState`] pins a key, a default and an area once, so every part of
//! a program that needs the same setting binds to it the same way:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use synced_state::{MemoryBackend, SharedState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let theme = SharedState::local(backend, "theme", "light".to_string());
//!
//!     let toolbar = theme.bind();
//!     let preview = theme.bind();
//!     toolbar.update("dark".to_string());
//!     let _ = preview.wait_until_resolved().await;
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::area::StorageArea;
use crate::backend::StorageBackend;
use crate::binding::{InitialValue, SyncedState};

/// A `(key, default, area)` triple that hands out bindings.
///
/// The default is resolved when the `SharedState` is created; every
/// binding from [`bind`](Self::bind) starts from that same seed. Bindings
/// keep separate local values and converge through change events.
pub struct SharedState<T> {
    backend: Arc<dyn StorageBackend>,
    key: Arc<str>,
    seed: T,
    area: StorageArea,
}

impl<T: Clone> Clone for SharedState<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            key: Arc::clone(&self.key),
            seed: self.seed.clone(),
            area: self.area,
        }
    }
}

impl<T> SharedState<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: impl Into<InitialValue<T>>,
        area: StorageArea,
    ) -> Self {
        Self {
            backend,
            key: Arc::from(key.into()),
            seed: initial.into().resolve(),
            area,
        }
    }

    pub fn local(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: impl Into<InitialValue<T>>,
    ) -> Self {
        Self::new(backend, key, initial, StorageArea::Local)
    }

    pub fn sync(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: impl Into<InitialValue<T>>,
    ) -> Self {
        Self::new(backend, key, initial, StorageArea::Sync)
    }

    pub fn session(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: impl Into<InitialValue<T>>,
    ) -> Self {
        Self::new(backend, key, initial, StorageArea::Session)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn area(&self) -> StorageArea {
        self.area
    }

    pub fn seed(&self) -> &T {
        &self.seed
    }

    /// Create and activate a new binding with this identity.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(&self) -> SyncedState<T> {
        SyncedState::new(
            Arc::clone(&self.backend),
            self.key.as_ref(),
            self.seed.clone(),
            self.area,
        )
    }
}
