//! Change events broadcast by storage backends.
//!
//! Every mutation of any key in any area produces one [`ChangeEvent`] on the
//! backend's channel. Subscribers see all of them and filter for what they
//! care about, the same way a binding checks area and key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::warn;

use crate::area::StorageArea;

/// Old and new value of a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
    /// Value before the change, if the key existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Value after the change. `None` means the key was removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl StorageChange {
    /// A key written with `new_value`.
    pub fn written(old_value: Option<Value>, new_value: Value) -> Self {
        Self {
            old_value,
            new_value: Some(new_value),
        }
    }

    /// A key removed from its area.
    pub fn removed(old_value: Value) -> Self {
        Self {
            old_value: Some(old_value),
            new_value: None,
        }
    }

    /// True if nothing is stored under the key anymore.
    pub fn is_removal(&self) -> bool {
        self.new_value.is_none()
    }
}

/// One notification: a set of keys changed together in one area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub area: StorageArea,
    pub changes: BTreeMap<String, StorageChange>,
}

impl ChangeEvent {
    pub fn new(area: StorageArea, changes: BTreeMap<String, StorageChange>) -> Self {
        Self { area, changes }
    }

    /// An event touching exactly one key.
    pub fn single(area: StorageArea, key: impl Into<String>, change: StorageChange) -> Self {
        let mut changes = BTreeMap::new();
        changes.insert(key.into(), change);
        Self { area, changes }
    }

    /// The change for `key`, if this event is for `area` and includes `key`.
    pub fn change_for(&self, area: StorageArea, key: &str) -> Option<&StorageChange> {
        if self.area != area {
            return None;
        }
        self.changes.get(key)
    }
}

/// Backend-wide stream of change events.
///
/// Dropping the stream unsubscribes. A subscriber that falls more than the
/// channel capacity behind skips the missed events and carries on; the
/// stream ends once the backend is gone.
pub struct ChangeStream {
    inner: BroadcastStream<ChangeEvent>,
}

impl ChangeStream {
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    warn!(missed, "change subscriber lagged, skipping events");
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Handle for publishing change events to subscribers.
#[derive(Clone)]
pub struct ChangeSender {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeSender {
    /// Create a new sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    pub fn send(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> ChangeStream {
        ChangeStream::new(self.sender.subscribe())
    }

    /// Number of live subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeSender {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CHANGE_CAPACITY)
    }
}
