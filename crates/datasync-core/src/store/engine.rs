//! Embedded key-value store with prefix watches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sled::{Db, Tree};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use datasync_proto::decode_value;

use super::resync::{await_ack, deliver_resync, ResyncReport};
use super::StoreConfig;
use crate::capability::{Publisher, Watcher};
use crate::error::Error;
use crate::event::{ChangeEvent, ResyncEntry, ResyncEvent};
use crate::registry::{Registry, WatchRegistration};

/// Tree name for key/value data.
const DATA_TREE: &str = "kv";

/// Where the initial snapshot of a new watch ended up.
enum InitialResync {
    Queued(oneshot::Receiver<()>),
    Deferred(ResyncEvent, oneshot::Receiver<()>),
    Disconnected,
}

struct StoreInner {
    db: Db,
    data_tree: Tree,
    registry: Arc<Registry>,
    /// Serializes writes with their dispatch so every watcher sees events in
    /// write order.
    write_lock: Mutex<()>,
    closed: AtomicBool,
    config: StoreConfig,
}

/// Key-value store backed by sled, implementing [`Watcher`] and
/// [`Publisher`].
///
/// Cloning is cheap; clones share the same database and watch registry.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<StoreInner>,
}

impl KvStore {
    /// Open or create a store with the given configuration.
    pub fn open(config: StoreConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let data_tree = db.open_tree(DATA_TREE)?;

        info!(
            path = %config.path.display(),
            temporary = config.temporary,
            recovered = db.was_recovered(),
            keys = data_tree.len(),
            "key-value store opened"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                data_tree,
                registry: Arc::new(Registry::new()),
                write_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Open a temporary store (deleted on drop).
    pub fn temporary() -> Result<Self, Error> {
        Self::open(StoreConfig::temporary())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Number of active watches.
    pub fn watch_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Get the raw value stored under `key`.
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.ensure_open()?;
        Ok(self.inner.data_tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Get and decode the value stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All key/value pairs whose key starts with `prefix`, in key order.
    pub fn list(&self, prefix: &str) -> Result<Vec<ResyncEntry>, Error> {
        self.ensure_open()?;
        let mut entries = Vec::new();
        for item in self.inner.data_tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
            entries.push(ResyncEntry {
                key,
                value: value.to_vec(),
            });
        }
        Ok(entries)
    }

    /// Send `event` to every watch whose prefix matches its key.
    ///
    /// Watches whose change channel has been closed are unregistered.
    async fn dispatch(&self, event: ChangeEvent) {
        let targets = self.inner.registry.change_targets(event.key());
        if targets.is_empty() {
            trace!(key = event.key(), "no watchers for key");
            return;
        }

        for target in targets {
            if target.change_tx.send(event.clone()).await.is_err() {
                debug!(
                    watch_id = target.id,
                    subscriber = %target.subscriber,
                    "change channel closed, dropping watch"
                );
                self.inner.registry.unregister(target.id);
                continue;
            }
            self.inner.registry.record_delivery(target.id);
        }

        trace!(
            key = event.key(),
            change_type = %event.change_type(),
            revision = event.revision(),
            "change event dispatched"
        );
    }

    /// Deliver a fresh snapshot to every watch and wait for acknowledgments.
    pub async fn resync(&self) -> Result<ResyncReport, Error> {
        self.ensure_open()?;

        let mut pending = Vec::new();
        {
            // Snapshots are taken without interleaving writes.
            let _guard = self.inner.write_lock.lock().await;
            self.ensure_open()?;
            let revision = self.inner.db.generate_id()?;
            for target in self.inner.registry.resync_targets() {
                let entries = self.list(&target.prefix)?;
                let (event, ack_rx) =
                    ResyncEvent::new(&target.subscriber, &target.prefix, revision, entries);
                pending.push((target, event, ack_rx));
            }
        }

        info!(subscribers = pending.len(), "starting resync round");

        let timeout = self.inner.config.resync_timeout;
        let mut tasks = JoinSet::new();
        for (index, (target, event, ack_rx)) in pending.into_iter().enumerate() {
            tasks.spawn(async move {
                let outcome =
                    deliver_resync(&target.subscriber, target.resync_tx, event, ack_rx, timeout)
                        .await;
                (index, target.subscriber, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => warn!(error = %e, "resync delivery task failed"),
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);

        let report = ResyncReport {
            outcomes: outcomes
                .into_iter()
                .map(|(_, subscriber, outcome)| (subscriber, outcome))
                .collect(),
        };

        info!(
            subscribers = report.outcomes.len(),
            all_acknowledged = report.all_acknowledged(),
            "resync round finished"
        );
        Ok(report)
    }

    /// Close the store: drop every watch and flush pending writes.
    ///
    /// Subsequent operations fail with [`Error::Closed`].
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.inner.write_lock.lock().await;
        let dropped = self.inner.registry.clear();
        let flushed = self.inner.db.flush_async().await?;

        info!(watches_dropped = dropped, bytes_flushed = flushed, "key-value store closed");
        Ok(())
    }
}

#[async_trait]
impl Publisher for KvStore {
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.ensure_open()?;

        let _guard = self.inner.write_lock.lock().await;
        // close() may have run while this write waited for the lock.
        self.ensure_open()?;
        let revision = self.inner.db.generate_id()?;
        let prev = self.inner.data_tree.insert(key.as_bytes(), value.as_slice())?;

        debug!(key, revision, updated = prev.is_some(), "put");

        let event = ChangeEvent::put(key, value, prev.map(|v| v.to_vec()), revision);
        self.dispatch(event).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        self.ensure_open()?;

        let _guard = self.inner.write_lock.lock().await;
        self.ensure_open()?;
        let revision = self.inner.db.generate_id()?;
        let prev = match self.inner.data_tree.remove(key.as_bytes())? {
            Some(prev) => prev,
            None => {
                debug!(key, "delete of missing key");
                return Ok(false);
            }
        };

        debug!(key, revision, "delete");

        self.dispatch(ChangeEvent::delete(key, prev.to_vec(), revision))
            .await;
        Ok(true)
    }
}

#[async_trait]
impl Watcher for KvStore {
    async fn watch(
        &self,
        subscriber: &str,
        change_tx: mpsc::Sender<ChangeEvent>,
        resync_tx: mpsc::Sender<ResyncEvent>,
        key_prefix: &str,
    ) -> Result<WatchRegistration, Error> {
        self.ensure_open()?;

        if subscriber.is_empty() {
            return Err(Error::Watch("subscriber name must not be empty".into()));
        }
        if change_tx.is_closed() || resync_tx.is_closed() {
            return Err(Error::Watch(format!(
                "event channels for '{}' are already closed",
                subscriber
            )));
        }

        // Register, snapshot and queue the initial resync under the write lock
        // so the snapshot reaches the resync channel before any change event
        // newer than it reaches the change channel.
        let (registration, pending, snapshot_keys) = {
            let _guard = self.inner.write_lock.lock().await;
            self.ensure_open()?;
            let entries = self.list(key_prefix)?;
            let revision = self.inner.db.generate_id()?;
            let id = self.inner.registry.register(
                subscriber,
                key_prefix,
                change_tx,
                resync_tx.clone(),
            );
            let registration =
                WatchRegistration::new(id, subscriber, key_prefix, &self.inner.registry);
            let snapshot_keys = entries.len();
            let (event, ack_rx) = ResyncEvent::new(subscriber, key_prefix, revision, entries);
            let pending = match resync_tx.try_send(event) {
                Ok(()) => InitialResync::Queued(ack_rx),
                Err(TrySendError::Full(event)) => InitialResync::Deferred(event, ack_rx),
                Err(TrySendError::Closed(_)) => InitialResync::Disconnected,
            };
            (registration, pending, snapshot_keys)
        };

        info!(
            subscriber,
            prefix = key_prefix,
            watch_id = registration.id(),
            snapshot_keys,
            "watch established"
        );

        // The subscriber may start consuming only after this call returns.
        let timeout = self.inner.config.resync_timeout;
        let name = subscriber.to_string();
        match pending {
            InitialResync::Queued(ack_rx) => {
                tokio::spawn(async move {
                    await_ack(&name, ack_rx, timeout).await;
                });
            }
            InitialResync::Deferred(event, ack_rx) => {
                warn!(subscriber, "resync channel full, initial snapshot deferred");
                tokio::spawn(async move {
                    deliver_resync(&name, resync_tx, event, ack_rx, timeout).await;
                });
            }
            InitialResync::Disconnected => {
                warn!(subscriber, "resync channel closed before initial snapshot");
            }
        }

        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PublisherExt;
    use crate::store::ResyncOutcome;
    use datasync_proto::ChangeType;
    use std::time::Duration;

    fn channels() -> (
        mpsc::Sender<ChangeEvent>,
        mpsc::Receiver<ChangeEvent>,
        mpsc::Sender<ResyncEvent>,
        mpsc::Receiver<ResyncEvent>,
    ) {
        let (change_tx, change_rx) = mpsc::channel(16);
        let (resync_tx, resync_rx) = mpsc::channel(16);
        (change_tx, change_rx, resync_tx, resync_rx)
    }

    #[tokio::test]
    async fn test_put_get() {
        let store = KvStore::temporary().unwrap();
        store.put("/a", &"hello").await.unwrap();

        assert_eq!(store.get::<String>("/a").unwrap(), Some("hello".to_string()));
        assert_eq!(store.get::<String>("/missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = KvStore::temporary().unwrap();
        store.put("/topology/a", &1u32).await.unwrap();
        store.put("/topology/b", &2u32).await.unwrap();
        store.put("/other/c", &3u32).await.unwrap();

        let keys: Vec<String> = store
            .list("/topology/")
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["/topology/a", "/topology/b"]);
    }

    #[tokio::test]
    async fn test_watch_receives_put_with_prev_value() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, mut change_rx, resync_tx, _resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        store.put("/topology/index", &1u32).await.unwrap();
        store.put("/topology/index", &2u32).await.unwrap();

        let first = change_rx.recv().await.unwrap();
        assert_eq!(first.value::<u32>().unwrap(), Some(1));
        assert!(!first.has_prev_value());

        let second = change_rx.recv().await.unwrap();
        assert_eq!(second.value::<u32>().unwrap(), Some(2));
        assert_eq!(second.prev_value::<u32>().unwrap(), Some(1));
        assert!(second.revision() > first.revision());
    }

    #[tokio::test]
    async fn test_watch_ignores_other_prefixes() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, mut change_rx, resync_tx, _resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        store.put("/other/key", &1u32).await.unwrap();
        store.put("/topology/index", &2u32).await.unwrap();

        let event = change_rx.recv().await.unwrap();
        assert_eq!(event.key(), "/topology/index");
        assert!(change_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_emits_event() {
        let store = KvStore::temporary().unwrap();
        store.put("/topology/index", &7u32).await.unwrap();

        let (change_tx, mut change_rx, resync_tx, _resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        assert!(store.delete("/topology/index").await.unwrap());
        assert!(!store.delete("/topology/index").await.unwrap());

        let event = change_rx.recv().await.unwrap();
        assert_eq!(event.change_type(), ChangeType::Delete);
        assert_eq!(event.prev_value::<u32>().unwrap(), Some(7));
        assert!(change_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_delivers_initial_snapshot() {
        let store = KvStore::temporary().unwrap();
        store.put("/topology/index", &1u32).await.unwrap();
        store.put("/other/key", &2u32).await.unwrap();

        let (change_tx, _change_rx, resync_tx, mut resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        let resync = resync_rx.recv().await.unwrap();
        assert_eq!(resync.subscriber(), "test");
        assert_eq!(resync.entries().len(), 1);
        assert_eq!(resync.entries()[0].key, "/topology/index");
        assert_eq!(resync.entries()[0].decode::<u32>().unwrap(), 1);
        resync.ack();
    }

    #[tokio::test]
    async fn test_watch_rejects_empty_subscriber() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, _change_rx, resync_tx, _resync_rx) = channels();
        let err = store
            .watch("", change_tx, resync_tx, "/topology/")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Watch(_)));
    }

    #[tokio::test]
    async fn test_watch_rejects_closed_channels() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, change_rx, resync_tx, _resync_rx) = channels();
        drop(change_rx);
        let err = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Watch(_)));
        assert_eq!(store.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_registration_stops_delivery() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, mut change_rx, resync_tx, _resync_rx) = channels();
        let reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();
        assert_eq!(store.watch_count(), 1);

        drop(reg);
        assert_eq!(store.watch_count(), 0);

        store.put("/topology/index", &1u32).await.unwrap();
        assert!(change_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_receiver_is_pruned() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, change_rx, resync_tx, _resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        drop(change_rx);
        store.put("/topology/index", &1u32).await.unwrap();
        assert_eq!(store.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_resync_round_reports_outcomes() {
        let store = KvStore::open(
            StoreConfig::temporary().with_resync_timeout(Duration::from_millis(200)),
        )
        .unwrap();

        let (c1, _c1_rx, r1, mut r1_rx) = channels();
        let (c2, _c2_rx, r2, mut r2_rx) = channels();
        let _a = store.watch("acker", c1, r1, "/topology/").await.unwrap();
        let _b = store.watch("dropper", c2, r2, "/topology/").await.unwrap();

        // Initial snapshots from watch().
        r1_rx.recv().await.unwrap().ack();
        r2_rx.recv().await.unwrap().ack();

        let acker = tokio::spawn(async move {
            r1_rx.recv().await.unwrap().ack();
        });
        let dropper = tokio::spawn(async move {
            drop(r2_rx.recv().await.unwrap());
        });

        let report = store.resync().await.unwrap();
        acker.await.unwrap();
        dropper.await.unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(
            report.outcome_for("acker"),
            Some(ResyncOutcome::Acknowledged)
        );
        assert_eq!(
            report.outcome_for("dropper"),
            Some(ResyncOutcome::Unacknowledged)
        );
        assert!(!report.all_acknowledged());
    }

    #[tokio::test]
    async fn test_close_rejects_operations() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, mut change_rx, resync_tx, _resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(store.is_closed());
        assert!(matches!(store.put("/topology/x", &1u32).await, Err(Error::Closed)));
        assert!(matches!(store.get_raw("/topology/x"), Err(Error::Closed)));
        assert!(change_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_initial_snapshot_queued_before_watch_returns() {
        let store = KvStore::temporary().unwrap();
        store.put("/topology/index", &1u32).await.unwrap();

        let (change_tx, mut change_rx, resync_tx, mut resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();
        let resync = resync_rx.try_recv().unwrap();

        store.put("/topology/index", &2u32).await.unwrap();
        let change = change_rx.recv().await.unwrap();
        assert!(change.revision() > resync.revision());
        resync.ack();
    }

    #[tokio::test]
    async fn test_initial_snapshot_deferred_when_channel_full() {
        let store = KvStore::temporary().unwrap();
        store.put("/topology/index", &1u32).await.unwrap();

        let (change_tx, _change_rx) = mpsc::channel(1);
        let (resync_tx, mut resync_rx) = mpsc::channel(1);
        let (queued, _queued_ack) = ResyncEvent::new("earlier", "/topology/", 0, vec![]);
        resync_tx.try_send(queued).unwrap();

        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        resync_rx.recv().await.unwrap().ack();
        let snapshot = resync_rx.recv().await.unwrap();
        assert_eq!(snapshot.subscriber(), "test");
        assert_eq!(snapshot.entries().len(), 1);
        snapshot.ack();
    }

    #[tokio::test]
    async fn test_write_waiting_on_close_is_rejected() {
        let store = KvStore::temporary().unwrap();
        let (change_tx, _change_rx, resync_tx, _resync_rx) = channels();
        let _reg = store
            .watch("test", change_tx, resync_tx, "/topology/")
            .await
            .unwrap();

        // Hold the write lock so the put passes its first open check and
        // then queues behind close().
        let guard = store.inner.write_lock.lock().await;
        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.put("/topology/late", &1u32).await })
        };
        tokio::task::yield_now().await;
        let closer = {
            let store = store.clone();
            tokio::spawn(async move { store.close().await })
        };
        tokio::task::yield_now().await;
        assert!(store.is_closed());
        drop(guard);

        assert!(matches!(writer.await.unwrap(), Err(Error::Closed)));
        closer.await.unwrap().unwrap();
        assert!(store
            .inner
            .data_tree
            .get("/topology/late".as_bytes())
            .unwrap()
            .is_none());
        assert!(matches!(store.delete("/topology/late").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KvStore::open(StoreConfig::new(dir.path())).unwrap();
            store.put("/topology/index", &42u32).await.unwrap();
            store.close().await.unwrap();
        }
        let store = KvStore::open(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(store.get::<u32>("/topology/index").unwrap(), Some(42));
    }
}
