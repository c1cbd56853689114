//! Observable state container with a single mutation entry point.
//!
//! Every mutation replaces the whole value under the container's lock and is
//! published to sibling windows through a [`SyncTransport`] before the lock is
//! released, so broadcasts leave in the same order the mutations were applied.
//! Snapshots from other origins are applied as a full replace; our own echoes
//! are ignored. Consistency is last-writer-wins with no merge: two windows
//! editing the same store at the same moment will lose one of the edits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::persistence::{PersistenceAdapter, PersistenceError};
use crate::core::sync::{origin_id, SyncEnvelope, SyncTransport};

pub struct StateContainer<T> {
    channel: String,
    origin: String,
    state: watch::Sender<Arc<T>>,
    revision: AtomicU64,
    transport: Arc<dyn SyncTransport>,
}

impl<T> StateContainer<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    pub fn new(channel: impl Into<String>, initial: T, transport: Arc<dyn SyncTransport>) -> Arc<Self> {
        let (state, _) = watch::channel(Arc::new(initial));
        Arc::new(Self {
            channel: channel.into(),
            origin: origin_id(),
            state,
            revision: AtomicU64::new(0),
            transport,
        })
    }

    /// Build a container from the blob stored under `key`.
    ///
    /// Missing, unreadable or undecodable blobs yield `T::default()`.
    pub async fn load(
        channel: impl Into<String>,
        adapter: &dyn PersistenceAdapter,
        key: &str,
        transport: Arc<dyn SyncTransport>,
    ) -> Arc<Self> {
        Self::load_with(channel, adapter, key, transport, |state| state).await
    }

    /// Like [`load`](Self::load), passing the restored value through
    /// `repair` before anything can observe it. Nothing is broadcast.
    pub async fn load_with(
        channel: impl Into<String>,
        adapter: &dyn PersistenceAdapter,
        key: &str,
        transport: Arc<dyn SyncTransport>,
        repair: impl FnOnce(T) -> T,
    ) -> Arc<Self> {
        let initial = match adapter.get_item(key).await {
            Ok(Some(blob)) => serde_json::from_str(&blob).unwrap_or_else(|err| {
                warn!(key, error = %err, "Discarding undecodable persisted state");
                T::default()
            }),
            Ok(None) => T::default(),
            Err(err) => {
                warn!(key, error = %err, "Failed to read persisted state; starting empty");
                T::default()
            }
        };
        Self::new(channel, repair(initial), transport)
    }

    pub fn get(&self) -> Arc<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.state.subscribe()
    }

    /// Number of changes applied so far, local and remote.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Replace the state with `update(current)` and broadcast it.
    pub fn mutate<F>(&self, update: F) -> Arc<T>
    where
        F: FnOnce(&T) -> T,
    {
        self.try_mutate(|current| Some(update(current)))
            .unwrap_or_else(|| self.get())
    }

    /// Like [`mutate`](Self::mutate), but `None` leaves the state untouched
    /// and publishes nothing.
    pub fn try_mutate<F>(&self, update: F) -> Option<Arc<T>>
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let mut applied = None;
        self.state.send_if_modified(|current| {
            let Some(next) = update(&**current) else {
                return false;
            };
            let next = Arc::new(next);
            self.publish(&next);
            *current = next.clone();
            self.revision.fetch_add(1, Ordering::SeqCst);
            applied = Some(next);
            true
        });
        applied
    }

    fn publish(&self, state: &T) {
        match serde_json::to_value(state) {
            Ok(state) => self.transport.publish(
                &self.channel,
                SyncEnvelope {
                    origin: self.origin.clone(),
                    state,
                },
            ),
            Err(err) => {
                warn!(channel = %self.channel, error = %err, "Failed to serialize state for sync");
            }
        }
    }

    /// Apply a snapshot received from the transport.
    ///
    /// Returns `false` for our own echoes and for snapshots that do not
    /// decode; neither touches the state.
    pub fn apply_remote(&self, envelope: SyncEnvelope) -> bool {
        if envelope.origin == self.origin {
            debug!(channel = %self.channel, "Ignoring own sync echo");
            return false;
        }
        let next: T = match serde_json::from_value(envelope.state) {
            Ok(next) => next,
            Err(err) => {
                warn!(
                    channel = %self.channel,
                    origin = %envelope.origin,
                    error = %err,
                    "Dropping undecodable sync snapshot"
                );
                return false;
            }
        };
        self.state.send_modify(|current| {
            *current = Arc::new(next);
            self.revision.fetch_add(1, Ordering::SeqCst);
        });
        true
    }

    /// Feed snapshots from the transport into this container until either
    /// side goes away.
    pub fn spawn_sync_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut snapshots = self.transport.subscribe(&self.channel);
        let container: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(envelope) = snapshots.next().await {
                let Some(container) = container.upgrade() else {
                    break;
                };
                container.apply_remote(envelope);
            }
        })
    }

    /// Write the state to `key` after every change, coalescing bursts.
    ///
    /// Failures are logged and the task keeps going; the next change retries
    /// with the then-current state.
    pub fn spawn_persistence(&self, adapter: Arc<dyn PersistenceAdapter>, key: String) -> JoinHandle<()> {
        let mut changes = self.state.subscribe();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let snapshot = changes.borrow_and_update().clone();
                if let Err(err) = write_snapshot(adapter.as_ref(), &key, snapshot.as_ref()).await {
                    warn!(channel = %channel, key = %key, error = %err, "Failed to persist state");
                }
            }
        })
    }

    /// Write the current state immediately.
    pub async fn persist(&self, adapter: &dyn PersistenceAdapter, key: &str) -> Result<(), PersistenceError> {
        let snapshot = self.get();
        write_snapshot(adapter, key, snapshot.as_ref()).await
    }
}

async fn write_snapshot<T: Serialize>(
    adapter: &dyn PersistenceAdapter,
    key: &str,
    state: &T,
) -> Result<(), PersistenceError> {
    let blob = serde_json::to_string(state)?;
    adapter.set_item(key, &blob).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::MemoryStore;
    use crate::core::state::SettingsState;
    use crate::core::sync::{BroadcastHub, NoopTransport};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for_revision<T>(container: &StateContainer<T>, revision: u64)
    where
        T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    {
        let mut changes = container.subscribe();
        timeout(Duration::from_secs(2), async {
            while container.revision() < revision {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("revision reached in time");
    }

    #[tokio::test]
    async fn own_write_is_counted_once() {
        let hub = BroadcastHub::new();
        let left = StateContainer::<SettingsState>::new("settings", SettingsState::default(), hub.clone());
        let right = StateContainer::<SettingsState>::new("settings", SettingsState::default(), hub.clone());
        let _left_listener = left.spawn_sync_listener();
        let _right_listener = right.spawn_sync_listener();

        left.mutate(|state| state.with_selected_model("llama3.2"));
        wait_for_revision(&right, 1).await;

        // Give the left listener time to see (and drop) its own echo.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(left.revision(), 1);
        assert_eq!(right.revision(), 1);
        assert_eq!(right.get().selected_model, "llama3.2");
    }

    #[tokio::test]
    async fn echo_is_rejected_and_foreign_snapshot_applied() {
        let hub = BroadcastHub::new();
        let mut wire = hub.subscribe("settings");
        let container = StateContainer::<SettingsState>::new("settings", SettingsState::default(), hub.clone());

        container.mutate(|state| state.with_api_url("http://gpu-box:11434"));
        let echo = wire.next().await.expect("published snapshot");
        assert_eq!(echo.origin, container.origin());
        assert!(!container.apply_remote(echo.clone()));
        assert_eq!(container.revision(), 1);

        let foreign = SyncEnvelope {
            origin: "another-window".into(),
            ..echo
        };
        assert!(container.apply_remote(foreign));
        assert_eq!(container.revision(), 2);
    }

    #[tokio::test]
    async fn undecodable_snapshot_is_dropped() {
        let container =
            StateContainer::<SettingsState>::new("settings", SettingsState::default(), Arc::new(NoopTransport));
        let applied = container.apply_remote(SyncEnvelope {
            origin: "elsewhere".into(),
            state: serde_json::json!({"apiUrl": 42}),
        });
        assert!(!applied);
        assert_eq!(container.revision(), 0);
    }

    #[tokio::test]
    async fn declined_mutation_changes_nothing() {
        let hub = BroadcastHub::new();
        let container = StateContainer::<SettingsState>::new("settings", SettingsState::default(), hub.clone());
        assert!(container.try_mutate(|_| None).is_none());
        assert_eq!(container.revision(), 0);
    }

    #[tokio::test]
    async fn persistence_task_writes_latest_state() {
        let store = Arc::new(MemoryStore::new());
        let container =
            StateContainer::<SettingsState>::new("settings", SettingsState::default(), Arc::new(NoopTransport));
        let _writer = container.spawn_persistence(store.clone(), "settings-storage".into());

        container.mutate(|state| state.with_selected_model("qwen2.5"));

        let persisted = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(Some(blob)) = store.get_item("settings-storage").await {
                    return blob;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("state persisted");

        let reloaded = StateContainer::<SettingsState>::load(
            "settings",
            store.as_ref(),
            "settings-storage",
            Arc::new(NoopTransport),
        )
        .await;
        assert_eq!(reloaded.get().selected_model, "qwen2.5");
        assert!(persisted.contains("qwen2.5"));
    }

    #[tokio::test]
    async fn corrupt_blob_loads_default() {
        let store = MemoryStore::new();
        store
            .set_item("settings-storage", "{\"apiUrl\":")
            .await
            .expect("seed");
        let container =
            StateContainer::<SettingsState>::load("settings", &store, "settings-storage", Arc::new(NoopTransport))
                .await;
        assert_eq!(*container.get(), SettingsState::default());
    }
}
