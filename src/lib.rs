//! # synced-state
//!
//! Reactive state bindings kept in sync with a multi-area key-value store.
//!
//! A binding ties one `(key, area)` pair to a live value plus three status
//! flags: whether the last storage operation succeeded, the last error,
//! and whether the initial load has settled. Bindings on the same key
//! converge through the backend's change stream, whichever handle wrote.
//!
//! - **Storage areas**: `local`, `sync` and `session`, each an isolated
//!   keyspace with its own quota
//! - **Seeded defaults**: a binding shows its default until the stored
//!   value arrives, and never writes the default back
//! - **Optimistic writes**: updates show immediately; a failed write is
//!   reported, not rolled back
//! - **Change reconciliation**: external writes and removals flow into
//!   every live binding
//!
//! ## Backends
//!
//! - [`MemoryBackend`]: in-process maps, with failure injection for tests
//! - [`SqliteBackend`]: embedded SQLite database
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use synced_state::{MemoryBackend, SyncedState};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Settings {
//!     dark_mode: bool,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let settings = SyncedState::local(backend, "settings", Settings { dark_mode: false });
//!
//!     let state = settings.wait_until_resolved().await;
//!     println!("loaded: {:?}", state.value());
//!
//!     settings.update_with(|s| Settings { dark_mode: !s.dark_mode });
//!
//!     let mut changes = settings.subscribe();
//!     while changes.changed().await.is_ok() {
//!         let state = changes.borrow_and_update().clone();
//!         if !state.is_persistent() {
//!             eprintln!("not saved: {}", state.error());
//!         }
//!     }
//! }
//! ```
//!
//! ## Durable Storage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use synced_state::{SqliteBackend, StorageArea, StorageConfig, SyncedState};
//!
//! #[tokio::main]
//! async fn main() -> synced_state::Result<()> {
//!     let config = StorageConfig::load("storage.toml")?;
//!     let backend = Arc::new(SqliteBackend::open("state.db", &config).await?);
//!
//!     let volume = SyncedState::new(backend, "volume", 50u8, StorageArea::Sync);
//!     volume.update(80u8);
//!
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod area;
pub mod backend;
pub mod binding;
pub mod change;
pub mod config;
pub mod error;
pub mod memory;
pub mod shared;
pub mod sqlite;

// Re-export main types
pub use adapter::StorageAdapter;
pub use area::StorageArea;
pub use backend::{StorageBackend, MAX_KEY_LENGTH};
pub use binding::{BindingState, InitialValue, SyncedState, Update};
pub use change::{ChangeEvent, ChangeSender, ChangeStream, StorageChange};
pub use config::{AreaQuota, AreaQuotas, SqliteConfig, StorageConfig};
pub use error::{Result, StorageError};
pub use memory::MemoryBackend;
pub use shared::SharedState;
pub use sqlite::SqliteBackend;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::area::StorageArea;
    pub use crate::backend::StorageBackend;
    pub use crate::binding::{BindingState, InitialValue, SyncedState, Update};
    pub use crate::error::{Result, StorageError};
    pub use crate::memory::MemoryBackend;
    pub use crate::shared::SharedState;
    pub use crate::sqlite::SqliteBackend;
}
