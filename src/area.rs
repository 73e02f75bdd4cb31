//! Storage areas: isolated key-value namespaces sharing one backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StorageError;

/// A named storage area.
///
/// Every area has its own keyspace and quota. `Local` is kept on this
/// device, `Sync` is meant to follow the user across devices, and
/// `Session` lives only as long as the backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    Local,
    Sync,
    Session,
}

impl StorageArea {
    /// All areas, in declaration order.
    pub const ALL: [StorageArea; 3] = [StorageArea::Local, StorageArea::Sync, StorageArea::Session];

    /// The area's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Local => "local",
            StorageArea::Sync => "sync",
            StorageArea::Session => "session",
        }
    }
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageArea {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageArea::Local),
            "sync" => Ok(StorageArea::Sync),
            "session" => Ok(StorageArea::Session),
            other => Err(StorageError::Config(format!(
                "unknown storage area '{}', expected local, sync or session",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for area in StorageArea::ALL {
            assert_eq!(area.as_str().parse::<StorageArea>().unwrap(), area);
        }
    }

    #[test]
    fn test_parse_unknown() {
        let err = "managed".parse::<StorageArea>().unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_serialize_lowercase() {
        let json = serde_json::to_string(&StorageArea::Session).unwrap();
        assert_eq!(json, "\"session\"");
    }
}
