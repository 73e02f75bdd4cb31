//! Synchronized bindings: one live value per `(key, area)` pair.
//!
//! A [`SyncedState`] keeps a local copy of the value stored under its key,
//! seeded from a caller-supplied default until the first load settles. It
//! writes updates through a [`StorageAdapter`] and follows the backend's
//! change stream, which is how independent bindings on the same key
//! converge after one of them writes.
//!
//! # Lifecycle
//!
//! ```text
//! Seeded --activate--> Loading --ok--> Resolved (persistent)
//!                              \--err-> Resolved (degraded)
//! ```
//!
//! Each activation runs as one tokio task that owns the load, the change
//! subscription and the update queue, so the local value is only ever
//! touched from that task. [`SyncedState::deactivate`] (or dropping the
//! binding) aborts the task and drops the subscription.
//!
//! # Invariants
//!
//! 1. `is_persistent()` is false exactly when `error()` is non-empty.
//! 2. `is_initial_state_resolved()` flips to true once per activation and
//!    never back, except that [`SyncedState::rebind`] starts a new identity.
//! 3. A failed write never reverts the value the consumer sees. The value
//!    it attempted to store is restored if anything replaced it meanwhile.
//! 4. Results belonging to an older activation are discarded. Every
//!    publish checks the activation generation under the channel's write
//!    lock.
//!
//! # Ordering
//!
//! The load and the change stream race: whichever lands last wins. Writes
//! are not serialized either. Two rapid updates may complete out of order;
//! the status of the most recently issued write that has completed is what
//! remains. The change event of a write that a newer local write has
//! superseded is ignored.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::adapter::StorageAdapter;
use crate::area::StorageArea;
use crate::backend::StorageBackend;
use crate::change::{ChangeEvent, ChangeStream};
use crate::error::{Result, StorageError};

/// The default a binding starts from.
///
/// A producer runs exactly once, when the binding (or
/// [`SharedState`](crate::shared::SharedState)) is created.
pub enum InitialValue<T> {
    Value(T),
    Producer(Box<dyn FnOnce() -> T + Send>),
}

impl<T> InitialValue<T> {
    /// Defer computing the default to a closure.
    pub fn lazy(f: impl FnOnce() -> T + Send + 'static) -> Self {
        InitialValue::Producer(Box::new(f))
    }

    pub fn resolve(self) -> T {
        match self {
            InitialValue::Value(value) => value,
            InitialValue::Producer(f) => f(),
        }
    }
}

impl<T> From<T> for InitialValue<T> {
    fn from(value: T) -> Self {
        InitialValue::Value(value)
    }
}

impl<T> fmt::Debug for InitialValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialValue::Value(_) => f.write_str("InitialValue::Value(..)"),
            InitialValue::Producer(_) => f.write_str("InitialValue::Producer(..)"),
        }
    }
}

/// A new value, or a function of the current one.
pub enum Update<T> {
    Replace(T),
    With(Box<dyn FnOnce(&T) -> T + Send>),
}

impl<T> Update<T> {
    /// Compute the next value from the current one.
    pub fn with(f: impl FnOnce(&T) -> T + Send + 'static) -> Self {
        Update::With(Box::new(f))
    }

    fn apply(self, current: &T) -> T {
        match self {
            Update::Replace(value) => value,
            Update::With(f) => f(current),
        }
    }
}

impl<T> From<T> for Update<T> {
    fn from(value: T) -> Self {
        Update::Replace(value)
    }
}

/// What a consumer sees of a binding at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingState<T> {
    value: T,
    is_persistent: bool,
    error: String,
    is_initial_state_resolved: bool,
    generation: u64,
}

impl<T> BindingState<T> {
    fn seeded(value: T, generation: u64) -> Self {
        Self {
            value,
            is_persistent: true,
            error: String::new(),
            is_initial_state_resolved: false,
            generation,
        }
    }

    /// Best-known value for the key.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// False if the last storage operation failed or nothing is stored.
    pub fn is_persistent(&self) -> bool {
        self.is_persistent
    }

    /// Description of the last failure; empty while persistent.
    pub fn error(&self) -> &str {
        &self.error
    }

    /// True once the first load has settled, successfully or not.
    pub fn is_initial_state_resolved(&self) -> bool {
        self.is_initial_state_resolved
    }

    fn mark_persistent(&mut self) {
        self.is_persistent = true;
        self.error.clear();
    }

    fn mark_failed(&mut self, error: impl fmt::Display) {
        let message = error.to_string();
        self.is_persistent = false;
        self.error = if message.is_empty() {
            "unknown storage error".to_string()
        } else {
            message
        };
    }
}

/// A live binding of one `(key, area)` pair to a local value.
///
/// Must be created inside a tokio runtime.
pub struct SyncedState<T> {
    adapter: StorageAdapter,
    key: String,
    seed: T,
    state: Arc<watch::Sender<BindingState<T>>>,
    updates: Option<mpsc::UnboundedSender<Update<T>>>,
    task: Option<JoinHandle<()>>,
}

impl<T> SyncedState<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create and activate a binding.
    ///
    /// The initial value is resolved here, once. The binding immediately
    /// subscribes to changes and starts loading the stored value.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: impl Into<InitialValue<T>>,
        area: StorageArea,
    ) -> Self {
        let seed = initial.into().resolve();
        let (state, _) = watch::channel(BindingState::seeded(seed.clone(), 0));

        let mut binding = Self {
            adapter: StorageAdapter::new(backend, area),
            key: key.into(),
            seed,
            state: Arc::new(state),
            updates: None,
            task: None,
        };
        binding.activate();
        binding
    }

    /// Binding on the `local` area.
    pub fn local(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: impl Into<InitialValue<T>>,
    ) -> Self {
        Self::new(backend, key, initial, StorageArea::Local)
    }

    /// Binding on the `sync` area.
    pub fn sync(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: impl Into<InitialValue<T>>,
    ) -> Self {
        Self::new(backend, key, initial, StorageArea::Sync)
    }

    /// Binding on the `session` area.
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
        self.adapter.area()
    }

    /// The resolved initial value.
    pub fn seed(&self) -> &T {
        &self.seed
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> BindingState<T> {
        self.state.borrow().clone()
    }

    pub fn value(&self) -> T {
        self.state.borrow().value.clone()
    }

    pub fn is_persistent(&self) -> bool {
        self.state.borrow().is_persistent
    }

    pub fn error(&self) -> String {
        self.state.borrow().error.clone()
    }

    pub fn is_initial_state_resolved(&self) -> bool {
        self.state.borrow().is_initial_state_resolved
    }

    /// A receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<BindingState<T>> {
        self.state.subscribe()
    }

    /// Wait for the first load to settle and return the state at that point.
    ///
    /// Returns the current state right away on an inactive binding.
    pub async fn wait_until_resolved(&self) -> BindingState<T> {
        if !self.is_active() {
            return self.state();
        }
        let mut receiver = self.state.subscribe();
        if let Ok(state) = receiver.wait_for(|s| s.is_initial_state_resolved).await {
            return state.clone();
        }
        self.state()
    }

    /// True until [`deactivate`](Self::deactivate) is called.
    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Replace the value, or derive it from the current one.
    ///
    /// The local value changes as soon as the binding task picks the update
    /// up; the outcome of the write shows in `is_persistent` / `error`.
    /// Updates issued before the first load settles are applied after it,
    /// so a producer always sees the loaded value.
    pub fn update(&self, update: impl Into<Update<T>>) {
        match &self.updates {
            Some(updates) => {
                if updates.send(update.into()).is_err() {
                    debug!(key = %self.key, "binding task gone, update dropped");
                }
            }
            None => debug!(key = %self.key, "update on inactive binding ignored"),
        }
    }

    /// Shorthand for `update(Update::with(f))`.
    pub fn update_with(&self, f: impl FnOnce(&T) -> T + Send + 'static) {
        self.update(Update::with(f));
    }

    /// Point the binding at another key or area.
    ///
    /// This is a new identity: the current activation is torn down, the
    /// state goes back to the seed and a fresh load starts. Nothing carries
    /// over except the seed itself.
    pub fn rebind(&mut self, key: impl Into<String>, area: StorageArea) {
        let key = key.into();
        if key == self.key && area == self.area() && self.is_active() {
            return;
        }

        self.deactivate();
        self.key = key;
        self.adapter = StorageAdapter::new(Arc::clone(self.adapter.backend()), area);

        let seed = self.seed.clone();
        self.state.send_modify(|state| {
            *state = BindingState::seeded(seed, state.generation + 1);
        });
        self.activate();
    }

    /// Stop following storage.
    ///
    /// Aborts the binding task and drops the change subscription. Loads,
    /// writes and events that complete afterwards are discarded; the last
    /// state stays readable.
    pub fn deactivate(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        self.updates = None;
        retire(&self.state);
        debug!(key = %self.key, area = %self.area(), "binding deactivated");
    }

    fn activate(&mut self) {
        let generation = self.state.borrow().generation;
        // Subscribe before the load is issued so no change is missed.
        let changes = self.adapter.backend().subscribe();
        let (updates, queue) = mpsc::unbounded_channel();

        let activation = Activation {
            adapter: self.adapter.clone(),
            key: self.key.clone(),
            seed: self.seed.clone(),
            generation,
            state: Arc::clone(&self.state),
        };

        debug!(key = %self.key, area = %self.area(), generation, "binding activated");
        self.task = Some(tokio::spawn(activation.run(changes, queue)));
        self.updates = Some(updates);
    }
}

impl<T> Drop for SyncedState<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            retire(&self.state);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedState")
            .field("key", &self.key)
            .field("area", &self.adapter.area())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Invalidate the current generation without notifying receivers.
fn retire<T>(state: &watch::Sender<BindingState<T>>) {
    state.send_if_modified(|state| {
        state.generation += 1;
        false
    });
}

/// Everything one activation needs, owned by its task.
struct Activation<T> {
    adapter: StorageAdapter,
    key: String,
    seed: T,
    generation: u64,
    state: Arc<watch::Sender<BindingState<T>>>,
}

/// Outcome of one write, tagged with its sequence number.
type Written<T> = (u64, T, Result<()>);

/// Upper bound on writes whose change event has not come back yet.
const MAX_PENDING_ECHOES: usize = 64;

/// Bookkeeping for the writes one activation has issued.
///
/// Every successful write comes back as a change event. Once a newer write
/// has been issued, the event of an older one is stale and must not
/// overwrite the newer optimistic value.
#[derive(Debug, Default)]
struct WriteLog {
    issued: u64,
    settled: u64,
    echoes: VecDeque<(u64, Value)>,
}

impl WriteLog {
    fn issue(&mut self, value: Option<Value>) -> u64 {
        self.issued += 1;
        if let Some(value) = value {
            if self.echoes.len() == MAX_PENDING_ECHOES {
                self.echoes.pop_front();
            }
            self.echoes.push_back((self.issued, value));
        }
        self.issued
    }

    /// Consume the echo matching `value`, reporting whether a newer write
    /// has superseded it.
    fn is_superseded_echo(&mut self, value: &Value) -> bool {
        let Some(pos) = self.echoes.iter().position(|(_, v)| v == value) else {
            return false;
        };
        match self.echoes.remove(pos) {
            Some((seq, _)) => seq < self.issued,
            None => false,
        }
    }

    /// Record a completion. Returns false if a newer write already settled.
    fn settle(&mut self, seq: u64, succeeded: bool) -> bool {
        if !succeeded {
            // A failed write is never broadcast.
            self.echoes.retain(|(s, _)| *s != seq);
        }
        if seq < self.settled {
            return false;
        }
        self.settled = seq;
        true
    }

    fn is_latest(&self, seq: u64) -> bool {
        seq == self.issued
    }
}

impl<T> Activation<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn run(self, mut changes: ChangeStream, mut queue: mpsc::UnboundedReceiver<Update<T>>) {
        let (written, mut completions) = mpsc::unbounded_channel::<Written<T>>();
        let mut writes = WriteLog::default();
        let mut load = pin!(self.adapter.get(&self.key, &self.seed));
        let mut loading = true;

        loop {
            tokio::select! {
                result = &mut load, if loading => {
                    loading = false;
                    self.apply_load(result);
                }
                Some(event) = changes.next() => self.apply_change(&event, &mut writes),
                Some(update) = queue.recv(), if !loading => {
                    if let Some(value) = self.apply_update(update) {
                        let seq = writes.issue(serde_json::to_value(&value).ok());
                        self.spawn_write(seq, value, written.clone());
                    }
                }
                Some((seq, value, result)) = completions.recv() => {
                    self.apply_write(&mut writes, seq, value, result);
                }
                else => break,
            }
        }

        debug!(key = %self.key, generation = self.generation, "binding task finished");
    }

    /// Publish a mutation unless this activation has been retired.
    fn publish(&self, f: impl FnOnce(&mut BindingState<T>)) -> bool {
        self.state.send_if_modified(|state| {
            if state.generation != self.generation {
                return false;
            }
            f(state);
            true
        })
    }

    fn apply_load(&self, result: Result<T>) {
        let applied = match result {
            Ok(value) => self.publish(|state| {
                state.value = value;
                state.mark_persistent();
                state.is_initial_state_resolved = true;
            }),
            Err(err) => {
                warn!(key = %self.key, area = %self.adapter.area(), error = %err, "initial load failed, keeping default");
                self.publish(|state| {
                    state.mark_failed(&err);
                    state.is_initial_state_resolved = true;
                })
            }
        };
        if !applied {
            debug!(key = %self.key, "discarded load result of retired binding");
        }
    }

    fn apply_change(&self, event: &ChangeEvent, writes: &mut WriteLog) {
        let Some(change) = event.change_for(self.adapter.area(), &self.key) else {
            return;
        };

        match &change.new_value {
            Some(raw) if writes.is_superseded_echo(raw) => {
                debug!(key = %self.key, "ignoring echo of superseded write");
            }
            Some(raw) => match serde_json::from_value::<T>(raw.clone()) {
                Ok(value) => {
                    debug!(key = %self.key, "applying external change");
                    self.publish(|state| {
                        state.value = value;
                        state.mark_persistent();
                    });
                }
                Err(err) => {
                    let err = StorageError::from(err);
                    warn!(key = %self.key, error = %err, "ignoring change with incompatible value");
                    self.publish(|state| state.mark_failed(&err));
                }
            },
            None => {
                debug!(key = %self.key, "key removed, falling back to default");
                let seed = self.seed.clone();
                let message = format!(
                    "no value stored under key '{}' in {} storage",
                    self.key,
                    self.adapter.area()
                );
                self.publish(|state| {
                    state.value = seed;
                    state.mark_failed(message);
                });
            }
        }
    }

    fn apply_update(&self, update: Update<T>) -> Option<T> {
        // Run the producer outside the channel lock; it may read the binding.
        let current = self.state.borrow().value.clone();
        let next = update.apply(&current);
        let value = next.clone();
        self.publish(|state| state.value = value).then_some(next)
    }

    fn spawn_write(&self, seq: u64, value: T, written: mpsc::UnboundedSender<Written<T>>) {
        let adapter = self.adapter.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            let result = adapter.set(&key, &value).await;
            // The binding may be gone by now; its result goes nowhere.
            let _ = written.send((seq, value, result));
        });
    }

    fn apply_write(&self, writes: &mut WriteLog, seq: u64, value: T, result: Result<()>) {
        if !writes.settle(seq, result.is_ok()) {
            debug!(key = %self.key, seq, "discarded completion of superseded write");
            return;
        }
        match result {
            Ok(()) => {
                self.publish(BindingState::mark_persistent);
            }
            Err(err) => {
                warn!(key = %self.key, area = %self.adapter.area(), error = %err, "write failed, keeping local value");
                let restore = writes.is_latest(seq).then_some(value);
                self.publish(|state| {
                    if let Some(value) = restore {
                        state.value = value;
                    }
                    state.mark_failed(&err);
                });
            }
        }
    }
}
