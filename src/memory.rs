//! In-memory storage backend.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! It is the backend for tests and for consumers that only need in-process
//! synchronization. Backend failures can be injected per operation, which
//! is how the binding tests simulate an unavailable store.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::area::StorageArea;
use crate::backend::{validate_key, StorageBackend};
use crate::change::{ChangeEvent, ChangeSender, ChangeStream, StorageChange};
use crate::config::{item_size, AreaQuotas, AreaUsage, StorageConfig};
use crate::error::{Result, StorageError};

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Set,
    Remove,
    Clear,
}

#[derive(Default)]
struct Faults {
    once: HashMap<Op, VecDeque<String>>,
    always: HashMap<Op, String>,
}

impl Faults {
    fn take(&mut self, op: Op) -> Option<StorageError> {
        if let Some(message) = self.once.get_mut(&op).and_then(VecDeque::pop_front) {
            return Some(StorageError::Backend(message));
        }
        self.always
            .get(&op)
            .map(|message| StorageError::Backend(message.clone()))
    }
}

type AreaMap = BTreeMap<String, Value>;

/// In-memory implementation of [`StorageBackend`].
///
/// One ordered map per area behind a single RwLock, so every write and the
/// event it emits happen in one critical section.
pub struct MemoryBackend {
    areas: RwLock<BTreeMap<StorageArea, AreaMap>>,
    faults: Mutex<Faults>,
    quotas: AreaQuotas,
    notifier: ChangeSender,
}

impl MemoryBackend {
    /// Create an empty backend with default quotas.
    pub fn new() -> Self {
        Self::with_config(&StorageConfig::default())
    }

    pub fn with_config(config: &StorageConfig) -> Self {
        Self {
            areas: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            quotas: config.quotas.clone(),
            notifier: ChangeSender::new(config.change_capacity),
        }
    }

    /// Number of keys stored in `area`.
    pub fn len(&self, area: StorageArea) -> usize {
        self.areas.read().get(&area).map_or(0, BTreeMap::len)
    }

    /// Check if `area` holds no keys.
    pub fn is_empty(&self, area: StorageArea) -> bool {
        self.len(area) == 0
    }

    /// Current value under `key`, bypassing fault injection.
    pub fn peek(&self, area: StorageArea, key: &str) -> Option<Value> {
        self.areas.read().get(&area).and_then(|m| m.get(key)).cloned()
    }

    /// Store a value without quota checks and without broadcasting.
    pub fn set_silently(&self, area: StorageArea, key: &str, value: Value) {
        self.areas
            .write()
            .entry(area)
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Broadcast an event as if another context had changed the storage.
    pub fn emit(&self, event: ChangeEvent) {
        self.notifier.send(event);
    }

    /// Make the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: Op, message: impl Into<String>) {
        self.faults
            .lock()
            .once
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Make every call of `op` fail with `message` until cleared.
    pub fn fail_always(&self, op: Op, message: impl Into<String>) {
        self.faults.lock().always.insert(op, message.into());
    }

    pub fn clear_failures(&self) {
        let mut faults = self.faults.lock();
        faults.once.clear();
        faults.always.clear();
    }

    /// Number of live change subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.notifier.receiver_count()
    }

    fn check_fault(&self, op: Op) -> Result<()> {
        match self.faults.lock().take(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn usage(map: &AreaMap, key: &str) -> AreaUsage {
        AreaUsage {
            total_bytes: map.iter().map(|(k, v)| item_size(k, v)).sum(),
            items: map.len(),
            replaced_bytes: map.get(key).map(|v| item_size(key, v)),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, area: StorageArea, key: &str, default: Value) -> Result<Value> {
        validate_key(key)?;
        self.check_fault(Op::Get)?;

        let areas = self.areas.read();
        Ok(areas
            .get(&area)
            .and_then(|m| m.get(key))
            .cloned()
            .unwrap_or(default))
    }

    async fn set(&self, area: StorageArea, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        self.check_fault(Op::Set)?;

        let mut areas = self.areas.write();
        let map = areas.entry(area).or_default();

        self.quotas
            .for_area(area)
            .check(area, key, &value, &Self::usage(map, key))?;

        let old_value = map.insert(key.to_string(), value.clone());
        self.notifier.send(ChangeEvent::single(
            area,
            key,
            StorageChange::written(old_value, value),
        ));

        Ok(())
    }

    async fn remove(&self, area: StorageArea, key: &str) -> Result<()> {
        validate_key(key)?;
        self.check_fault(Op::Remove)?;

        let mut areas = self.areas.write();
        if let Some(old_value) = areas.get_mut(&area).and_then(|m| m.remove(key)) {
            self.notifier.send(ChangeEvent::single(
                area,
                key,
                StorageChange::removed(old_value),
            ));
        }
        Ok(())
    }

    async fn clear(&self, area: StorageArea) -> Result<()> {
        self.check_fault(Op::Clear)?;

        let mut areas = self.areas.write();
        let removed = areas.remove(&area).unwrap_or_default();
        if !removed.is_empty() {
            let changes = removed
                .into_iter()
                .map(|(k, v)| (k, StorageChange::removed(v)))
                .collect();
            self.notifier.send(ChangeEvent::new(area, changes));
        }
        Ok(())
    }

    async fn keys(&self, area: StorageArea) -> Result<Vec<String>> {
        let areas = self.areas.read();
        Ok(areas
            .get(&area)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn bytes_in_use(&self, area: StorageArea, key: Option<&str>) -> Result<usize> {
        let areas = self.areas.read();
        let Some(map) = areas.get(&area) else {
            return Ok(0);
        };
        Ok(match key {
            Some(key) => map.get(key).map_or(0, |v| item_size(key, v)),
            None => map.iter().map(|(k, v)| item_size(k, v)).sum(),
        })
    }

    fn subscribe(&self) -> ChangeStream {
        self.notifier.subscribe()
    }
}
