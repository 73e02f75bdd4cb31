//! Backend configuration and per-area quotas.
//!
//! Configuration is plain data: build it in code or load it from TOML.
//!
//! ```toml
//! change_capacity = 256
//!
//! [sqlite]
//! max_connections = 2
//!
//! [quotas.sync]
//! max_bytes = 102400
//! max_item_bytes = 8192
//! max_items = 512
//! ```
//!
//! An area table given in the file replaces that area's defaults as a whole;
//! limits left out of it are unlimited.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::area::StorageArea;
use crate::error::{Result, StorageError};

/// Default capacity of the change-event channel.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// Total bytes allowed in the `sync` area.
pub const SYNC_QUOTA_BYTES: usize = 102_400;
/// Bytes allowed per item in the `sync` area.
pub const SYNC_QUOTA_BYTES_PER_ITEM: usize = 8_192;
/// Items allowed in the `sync` area.
pub const SYNC_MAX_ITEMS: usize = 512;
/// Total bytes allowed in the `local` and `session` areas.
pub const LOCAL_QUOTA_BYTES: usize = 10_485_760;

/// Top-level configuration shared by all backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Buffered change events per subscriber before the slowest one lags.
    pub change_capacity: usize,
    pub sqlite: SqliteConfig,
    pub quotas: AreaQuotas,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            change_capacity: DEFAULT_CHANGE_CAPACITY,
            sqlite: SqliteConfig::default(),
            quotas: AreaQuotas::default(),
        }
    }
}

impl StorageConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.change_capacity == 0 {
            return Err(StorageError::Config(
                "change_capacity must be greater than zero".to_string(),
            ));
        }
        if self.sqlite.max_connections == 0 {
            return Err(StorageError::Config(
                "sqlite.max_connections must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection settings for [`SqliteBackend`](crate::sqlite::SqliteBackend).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

impl SqliteConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout_secs: 30,
        }
    }
}

/// Quotas for every area.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AreaQuotas {
    pub local: AreaQuota,
    pub sync: AreaQuota,
    pub session: AreaQuota,
}

impl AreaQuotas {
    /// No limits in any area.
    pub fn unlimited() -> Self {
        Self {
            local: AreaQuota::default(),
            sync: AreaQuota::default(),
            session: AreaQuota::default(),
        }
    }

    pub fn for_area(&self, area: StorageArea) -> &AreaQuota {
        match area {
            StorageArea::Local => &self.local,
            StorageArea::Sync => &self.sync,
            StorageArea::Session => &self.session,
        }
    }
}

impl Default for AreaQuotas {
    fn default() -> Self {
        Self {
            local: AreaQuota {
                max_bytes: Some(LOCAL_QUOTA_BYTES),
                ..AreaQuota::default()
            },
            sync: AreaQuota {
                max_bytes: Some(SYNC_QUOTA_BYTES),
                max_item_bytes: Some(SYNC_QUOTA_BYTES_PER_ITEM),
                max_items: Some(SYNC_MAX_ITEMS),
            },
            session: AreaQuota {
                max_bytes: Some(LOCAL_QUOTA_BYTES),
                ..AreaQuota::default()
            },
        }
    }
}

/// Storage limits of one area. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AreaQuota {
    pub max_bytes: Option<usize>,
    pub max_item_bytes: Option<usize>,
    pub max_items: Option<usize>,
}

/// Current occupancy of an area, as seen just before a write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AreaUsage {
    /// Sum of [`item_size`] over all stored items.
    pub total_bytes: usize,
    /// Number of stored items.
    pub items: usize,
    /// Size of the item being overwritten, if the key already exists.
    pub replaced_bytes: Option<usize>,
}

/// Size charged against quotas for one item: key bytes plus JSON text bytes.
pub fn item_size(key: &str, value: &Value) -> usize {
    key.len() + value.to_string().len()
}

impl AreaQuota {
    /// Check that writing `value` under `key` keeps the area within quota.
    pub fn check(&self, area: StorageArea, key: &str, value: &Value, usage: &AreaUsage) -> Result<()> {
        let size = item_size(key, value);

        if let Some(max) = self.max_item_bytes {
            if size > max {
                return Err(StorageError::QuotaExceeded {
                    area,
                    detail: format!("item '{}' is {} bytes, limit is {}", key, size, max),
                });
            }
        }

        if let Some(max) = self.max_bytes {
            let total = usage
                .total_bytes
                .saturating_sub(usage.replaced_bytes.unwrap_or(0))
                + size;
            if total > max {
                return Err(StorageError::QuotaExceeded {
                    area,
                    detail: format!("area would hold {} bytes, limit is {}", total, max),
                });
            }
        }

        if let Some(max) = self.max_items {
            let items = usage.items + usize::from(usage.replaced_bytes.is_none());
            if items > max {
                return Err(StorageError::QuotaExceeded {
                    area,
                    detail: format!("area would hold {} items, limit is {}", items, max),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.change_capacity, DEFAULT_CHANGE_CAPACITY);
        assert_eq!(config.sqlite.max_connections, 5);
        assert_eq!(config.quotas.sync.max_item_bytes, Some(SYNC_QUOTA_BYTES_PER_ITEM));
        assert_eq!(config.quotas.local.max_items, None);
    }

    #[test]
    fn test_from_toml() {
        let config = StorageConfig::from_toml_str(
            r#"
            change_capacity = 16

            [quotas.sync]
            max_items = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.change_capacity, 16);
        assert_eq!(config.sqlite.busy_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.quotas.sync,
            AreaQuota {
                max_items: Some(2),
                ..AreaQuota::default()
            }
        );
        assert_eq!(config.quotas.local.max_bytes, Some(LOCAL_QUOTA_BYTES));
    }

    #[test]
    fn test_from_toml_rejects_zero_capacity() {
        let err = StorageConfig::from_toml_str("change_capacity = 0").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_from_toml_malformed() {
        let err = StorageConfig::from_toml_str("change_capacity = \"many\"").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "[sqlite]\nmax_connections = 1\n").unwrap();

        let config = StorageConfig::load(&path).unwrap();
        assert_eq!(config.sqlite.max_connections, 1);
    }

    #[test]
    fn test_item_size() {
        assert_eq!(item_size("k", &json!(true)), 5);
        assert_eq!(item_size("key", &json!({"a": 1})), 3 + 7);
    }

    #[test]
    fn test_per_item_limit() {
        let quota = AreaQuota {
            max_item_bytes: Some(10),
            ..AreaQuota::default()
        };
        let usage = AreaUsage::default();

        assert!(quota.check(StorageArea::Sync, "k", &json!(1), &usage).is_ok());
        let err = quota
            .check(StorageArea::Sync, "k", &json!("a long string value"), &usage)
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { area: StorageArea::Sync, .. }));
    }

    #[test]
    fn test_total_limit_counts_replacement() {
        let quota = AreaQuota {
            max_bytes: Some(20),
            ..AreaQuota::default()
        };
        let usage = AreaUsage {
            total_bytes: 18,
            items: 1,
            replaced_bytes: Some(18),
        };

        // Overwriting the only item frees its old size first.
        assert!(quota.check(StorageArea::Local, "key", &json!(12345), &usage).is_ok());

        let fresh = AreaUsage {
            replaced_bytes: None,
            ..usage
        };
        assert!(quota.check(StorageArea::Local, "other", &json!(1), &fresh).is_err());
    }

    #[test]
    fn test_item_count_limit() {
        let quota = AreaQuota {
            max_items: Some(1),
            ..AreaQuota::default()
        };
        let full = AreaUsage {
            total_bytes: 5,
            items: 1,
            replaced_bytes: None,
        };
        assert!(quota.check(StorageArea::Sync, "b", &json!(1), &full).is_err());

        let overwrite = AreaUsage {
            replaced_bytes: Some(5),
            ..full
        };
        assert!(quota.check(StorageArea::Sync, "a", &json!(1), &overwrite).is_ok());
    }
}
