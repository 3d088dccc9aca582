//! Change-event consumer.
//!
//! A [`ChangeConsumer`] owns one watch registration and the receiving ends of
//! its change and resync channels. [`ChangeConsumer::run`] waits on both
//! channels and a cancellation token, decodes every event under the watched
//! prefix into the payload type `T`, and hands the result to a
//! [`ChangeHandler`].
//!
//! Decode failures are logged and the event is skipped; the loop keeps going.
//! Every resync event is acknowledged after the handler has seen the snapshot.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use datasync_proto::ChangeType;

use crate::capability::{Publisher, PublisherExt, Watcher};
use crate::error::Error;
use crate::event::{ChangeEvent, ResyncEvent};
use crate::registry::WatchRegistration;

/// Default capacity of the change and resync channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// A change event with its values decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChange<T> {
    pub key: String,
    pub change_type: ChangeType,
    pub revision: u64,
    /// New value; `None` for deletes.
    pub value: Option<T>,
    /// Value before the change; `None` if the key did not exist.
    pub prev_value: Option<T>,
}

/// A resync snapshot with its entries decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResync<T> {
    pub prefix: String,
    /// Store revision the snapshot was taken at. Changes with a higher
    /// revision are newer than every entry in it.
    pub revision: u64,
    /// Entries that failed to decode are left out.
    pub entries: Vec<(String, T)>,
}

/// Reacts to decoded events.
pub trait ChangeHandler<T>: Send {
    /// Called once per change event under the watched prefix.
    fn on_change(&mut self, change: DecodedChange<T>);

    /// Called with the decoded snapshot of a resync event, before it is
    /// acknowledged.
    ///
    /// A snapshot can arrive after changes newer than it were already
    /// handled; compare `resync.revision` with the change revisions.
    fn on_resync(&mut self, _resync: DecodedResync<T>) {}
}

/// Lifecycle state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Watching,
    Stopped,
}

/// Counters kept by a running consumer.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    changes_received: AtomicU64,
    decode_attempts: AtomicU64,
    decode_failures: AtomicU64,
    ignored: AtomicU64,
    resyncs: AtomicU64,
}

impl ConsumerMetrics {
    /// Change events received, matching or not.
    pub fn changes_received(&self) -> u64 {
        self.changes_received.load(Ordering::Relaxed)
    }

    /// Change events whose values were decoded.
    pub fn decode_attempts(&self) -> u64 {
        self.decode_attempts.load(Ordering::Relaxed)
    }

    /// Change events and resync entries that failed to decode.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Change events outside the watched prefix.
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Resync events processed and acknowledged.
    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }
}

/// Consumes change and resync events for one watched prefix.
pub struct ChangeConsumer<T, H> {
    subscriber: String,
    prefix: String,
    change_rx: mpsc::Receiver<ChangeEvent>,
    resync_rx: mpsc::Receiver<ResyncEvent>,
    registration: WatchRegistration,
    handler: H,
    metrics: Arc<ConsumerMetrics>,
    state_tx: watch::Sender<ConsumerState>,
    /// Highest revision handed to `on_change`.
    last_revision: u64,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> ChangeConsumer<T, H>
where
    T: DeserializeOwned,
    H: ChangeHandler<T>,
{
    /// Register interest in every key under `prefix`.
    ///
    /// Fails if the watcher cannot establish the watch.
    pub async fn subscribe(
        watcher: &dyn Watcher,
        subscriber: &str,
        prefix: &str,
        capacity: usize,
        handler: H,
    ) -> Result<Self, Error> {
        let capacity = capacity.max(1);
        let (change_tx, change_rx) = mpsc::channel(capacity);
        let (resync_tx, resync_rx) = mpsc::channel(capacity);

        info!(subscriber, prefix, "subscribing watcher");
        let registration = watcher
            .watch(subscriber, change_tx, resync_tx, prefix)
            .await?;
        info!(subscriber, watch_id = registration.id(), "watcher subscribed");

        let (state_tx, _) = watch::channel(ConsumerState::Watching);

        Ok(Self {
            subscriber: subscriber.to_string(),
            prefix: prefix.to_string(),
            change_rx,
            resync_rx,
            registration,
            handler,
            metrics: Arc::new(ConsumerMetrics::default()),
            state_tx,
            last_revision: 0,
            _payload: PhantomData,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn registration(&self) -> &WatchRegistration {
        &self.registration
    }

    /// Shared counters, readable while the consumer runs.
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Receiver that observes the consumer's state.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    /// Consume events until `cancel` fires or both channels close.
    ///
    /// Cancellation is checked before each event, so nothing is processed once
    /// it has fired. Events still queued at that point are dropped. The watch
    /// is released on exit and the handler is returned.
    pub async fn run(mut self, cancel: CancellationToken) -> H {
        info!(subscriber = %self.subscriber, prefix = %self.prefix, "change consumer started");

        let mut change_open = true;
        let mut resync_open = true;

        while change_open || resync_open {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    warn!(subscriber = %self.subscriber, "stop watching events");
                    break;
                }
                // A queued snapshot goes first; queued changes apply on top.
                event = self.resync_rx.recv(), if resync_open => match event {
                    Some(event) => self.handle_resync(event),
                    None => {
                        debug!(subscriber = %self.subscriber, "resync channel closed");
                        resync_open = false;
                    }
                },
                event = self.change_rx.recv(), if change_open => match event {
                    Some(event) => self.handle_change(event),
                    None => {
                        debug!(subscriber = %self.subscriber, "change channel closed");
                        change_open = false;
                    }
                },
            }
        }

        self.registration.close();
        self.state_tx.send_replace(ConsumerState::Stopped);

        info!(
            subscriber = %self.subscriber,
            changes_received = self.metrics.changes_received(),
            decode_failures = self.metrics.decode_failures(),
            resyncs = self.metrics.resyncs(),
            "change consumer stopped"
        );

        self.handler
    }

    fn handle_change(&mut self, event: ChangeEvent) {
        self.metrics.changes_received.fetch_add(1, Ordering::Relaxed);
        trace!(subscriber = %self.subscriber, ?event, "received event");

        if !event.key().starts_with(&self.prefix) {
            self.metrics.ignored.fetch_add(1, Ordering::Relaxed);
            trace!(key = event.key(), prefix = %self.prefix, "key outside watched prefix");
            return;
        }

        self.metrics.decode_attempts.fetch_add(1, Ordering::Relaxed);
        match (event.value::<T>(), event.prev_value::<T>()) {
            (Ok(value), Ok(prev_value)) => {
                info!(
                    key = event.key(),
                    update = prev_value.is_some(),
                    change_type = %event.change_type(),
                    revision = event.revision(),
                    "change event arrived"
                );
                self.last_revision = self.last_revision.max(event.revision());
                self.handler.on_change(DecodedChange {
                    key: event.key().to_string(),
                    change_type: event.change_type(),
                    revision: event.revision(),
                    value,
                    prev_value,
                });
            }
            (Err(e), _) | (_, Err(e)) => {
                self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!(key = event.key(), error = %e, "failed to decode change event");
            }
        }
    }

    fn handle_resync(&mut self, event: ResyncEvent) {
        let mut decoded = Vec::with_capacity(event.entries().len());
        for entry in event.entries() {
            match entry.decode::<T>() {
                Ok(value) => decoded.push((entry.key.clone(), value)),
                Err(e) => {
                    self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                    error!(key = %entry.key, error = %e, "failed to decode resync entry");
                }
            }
        }

        info!(
            subscriber = %self.subscriber,
            revision = event.revision(),
            entries = decoded.len(),
            "resync event arrived"
        );
        if event.revision() < self.last_revision {
            debug!(
                subscriber = %self.subscriber,
                revision = event.revision(),
                last_change = self.last_revision,
                "resync snapshot older than handled changes"
            );
        }

        self.metrics.resyncs.fetch_add(1, Ordering::Relaxed);
        self.handler.on_resync(DecodedResync {
            prefix: event.prefix().to_string(),
            revision: event.revision(),
            entries: decoded,
        });
        event.ack();
    }
}

/// Write `value` under `key` through `publisher`.
///
/// This is the producer side of a watch: a consumer subscribed to a prefix
/// containing `key` observes the write as a change event. Errors are returned
/// as is and never retried.
pub async fn publish<T>(publisher: &dyn Publisher, key: &str, value: &T) -> Result<(), Error>
where
    T: Serialize + Sync + ?Sized,
{
    info!(key, "saving data");
    publisher.put(key, value).await.map_err(|e| {
        error!(key, error = %e, "failed to publish data");
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvStore;
    use std::time::Duration;

    /// Handler that forwards decoded events to the test.
    struct Forward {
        changes: mpsc::UnboundedSender<DecodedChange<u32>>,
        resyncs: mpsc::UnboundedSender<Vec<(String, u32)>>,
    }

    impl ChangeHandler<u32> for Forward {
        fn on_change(&mut self, change: DecodedChange<u32>) {
            let _ = self.changes.send(change);
        }

        fn on_resync(&mut self, resync: DecodedResync<u32>) {
            let _ = self.resyncs.send(resync.entries);
        }
    }

    fn forward() -> (
        Forward,
        mpsc::UnboundedReceiver<DecodedChange<u32>>,
        mpsc::UnboundedReceiver<Vec<(String, u32)>>,
    ) {
        let (changes, changes_rx) = mpsc::unbounded_channel();
        let (resyncs, resyncs_rx) = mpsc::unbounded_channel();
        (Forward { changes, resyncs }, changes_rx, resyncs_rx)
    }

    #[tokio::test]
    async fn test_decodes_matching_changes() {
        let store = KvStore::temporary().unwrap();
        let (handler, mut changes, _resyncs) = forward();
        let consumer = ChangeConsumer::<u32, _>::subscribe(&store, "test", "/topology/", 4, handler)
            .await
            .unwrap();
        let metrics = consumer.metrics();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        store.put("/topology/index", &1u32).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "/topology/index");
        assert_eq!(change.value, Some(1));
        assert_eq!(change.prev_value, None);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(metrics.decode_attempts(), 1);
        assert_eq!(metrics.decode_failures(), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_stop_loop() {
        let store = KvStore::temporary().unwrap();
        let (handler, mut changes, _resyncs) = forward();
        let consumer = ChangeConsumer::<u32, _>::subscribe(&store, "test", "/topology/", 4, handler)
            .await
            .unwrap();
        let metrics = consumer.metrics();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        store.put("/topology/bad", &"not a number").await.unwrap();
        store.put("/topology/good", &5u32).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "/topology/good");
        assert_eq!(metrics.decode_attempts(), 2);
        assert_eq!(metrics.decode_failures(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_keys_are_not_decoded() {
        let (change_tx, change_rx) = mpsc::channel(4);
        let (resync_tx, resync_rx) = mpsc::channel(4);
        let store = KvStore::temporary().unwrap();
        let (dummy_change_tx, _dummy_change_rx) = mpsc::channel(1);
        let (dummy_resync_tx, _dummy_resync_rx) = mpsc::channel(1);
        let registration = store
            .watch("test", dummy_change_tx, dummy_resync_tx, "/topology/")
            .await
            .unwrap();

        let (handler, mut changes, _resyncs) = forward();
        let (state_tx, _) = watch::channel(ConsumerState::Watching);
        let consumer = ChangeConsumer::<u32, Forward> {
            subscriber: "test".into(),
            prefix: "/topology/".into(),
            change_rx,
            resync_rx,
            registration,
            handler,
            metrics: Arc::new(ConsumerMetrics::default()),
            state_tx,
            last_revision: 0,
            _payload: PhantomData,
        };
        let metrics = consumer.metrics();
        let task = tokio::spawn(consumer.run(CancellationToken::new()));

        // A watcher that does not filter: the consumer still must.
        change_tx
            .send(ChangeEvent::put("/other/key", b"{{".to_vec(), None, 1))
            .await
            .unwrap();
        change_tx
            .send(ChangeEvent::put(
                "/topology/index",
                datasync_proto::encode_value(&9u32).unwrap(),
                None,
                2,
            ))
            .await
            .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "/topology/index");
        assert_eq!(metrics.ignored(), 1);
        assert_eq!(metrics.decode_attempts(), 1);
        assert_eq!(metrics.decode_failures(), 0);

        drop(change_tx);
        drop(resync_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resync_is_acknowledged() {
        let store = KvStore::temporary().unwrap();
        store.put("/topology/index", &3u32).await.unwrap();

        let (handler, _changes, mut resyncs) = forward();
        let consumer = ChangeConsumer::<u32, _>::subscribe(&store, "test", "/topology/", 4, handler)
            .await
            .unwrap();
        let metrics = consumer.metrics();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        let snapshot = resyncs.recv().await.unwrap();
        assert_eq!(snapshot, vec![("/topology/index".to_string(), 3)]);

        let report = store.resync().await.unwrap();
        assert!(report.all_acknowledged());
        assert_eq!(metrics.resyncs(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_processing() {
        let store = KvStore::temporary().unwrap();
        let (handler, mut changes, _resyncs) = forward();
        let consumer = ChangeConsumer::<u32, _>::subscribe(&store, "test", "/topology/", 4, handler)
            .await
            .unwrap();
        let mut state = consumer.state();
        let metrics = consumer.metrics();
        assert_eq!(*state.borrow(), ConsumerState::Watching);

        let cancel = CancellationToken::new();
        cancel.cancel();
        cancel.cancel();
        tokio::spawn(consumer.run(cancel.clone())).await.unwrap();

        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConsumerState::Stopped);
        assert_eq!(store.watch_count(), 0);

        store.put("/topology/index", &1u32).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(changes.try_recv().is_err());
        assert_eq!(metrics.changes_received(), 0);
    }

    #[tokio::test]
    async fn test_store_close_ends_loop() {
        let store = KvStore::temporary().unwrap();
        let (handler, _changes, _resyncs) = forward();
        let consumer = ChangeConsumer::<u32, _>::subscribe(&store, "test", "/topology/", 4, handler)
            .await
            .unwrap();
        let task = tokio::spawn(consumer.run(CancellationToken::new()));

        // Let the initial resync settle so its sender is dropped.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.close().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer should stop when the store closes")
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_propagates_watch_error() {
        let store = KvStore::temporary().unwrap();
        store.close().await.unwrap();

        let (handler, _changes, _resyncs) = forward();
        let result = ChangeConsumer::<u32, _>::subscribe(&store, "test", "/topology/", 4, handler).await;
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_publish_observed_by_own_consumer() {
        let store = KvStore::temporary().unwrap();
        let (handler, mut changes, _resyncs) = forward();
        let consumer = ChangeConsumer::<u32, _>::subscribe(&store, "test", "/topology/", 4, handler)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        publish(&store, "/topology/index", &7u32).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.value, Some(7));

        cancel.cancel();
        task.await.unwrap();

        store.close().await.unwrap();
        let err = publish(&store, "/topology/index", &8u32).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Resync(u64, Vec<(String, u32)>),
        Change(u64, String),
    }

    /// Handler that records every callback in arrival order.
    struct Journal {
        seen: mpsc::UnboundedSender<Seen>,
    }

    impl ChangeHandler<u32> for Journal {
        fn on_change(&mut self, change: DecodedChange<u32>) {
            let _ = self.seen.send(Seen::Change(change.revision, change.key));
        }

        fn on_resync(&mut self, resync: DecodedResync<u32>) {
            let _ = self.seen.send(Seen::Resync(resync.revision, resync.entries));
        }
    }

    #[tokio::test]
    async fn test_snapshot_handled_before_buffered_change() {
        let store = KvStore::temporary().unwrap();
        store.put("/topology/a", &1u32).await.unwrap();

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let consumer = ChangeConsumer::<u32, _>::subscribe(
            &store,
            "test",
            "/topology/",
            4,
            Journal { seen: seen_tx },
        )
        .await
        .unwrap();

        // Both channels hold an event before the loop starts.
        store.put("/topology/b", &2u32).await.unwrap();
        tokio::task::yield_now().await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        let first = seen.recv().await.unwrap();
        let second = seen.recv().await.unwrap();
        let (snapshot_revision, entries) = match first {
            Seen::Resync(revision, entries) => (revision, entries),
            other => panic!("expected snapshot first, got {:?}", other),
        };
        assert_eq!(entries, vec![("/topology/a".to_string(), 1)]);
        match second {
            Seen::Change(revision, key) => {
                assert_eq!(key, "/topology/b");
                assert!(revision > snapshot_revision);
            }
            other => panic!("expected change second, got {:?}", other),
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_snapshot_carries_older_revision() {
        let (change_tx, change_rx) = mpsc::channel(4);
        let (resync_tx, resync_rx) = mpsc::channel(4);
        let store = KvStore::temporary().unwrap();
        let (dummy_change_tx, _dummy_change_rx) = mpsc::channel(1);
        let (dummy_resync_tx, _dummy_resync_rx) = mpsc::channel(1);
        let registration = store
            .watch("test", dummy_change_tx, dummy_resync_tx, "/topology/")
            .await
            .unwrap();

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConsumerState::Watching);
        let consumer = ChangeConsumer::<u32, Journal> {
            subscriber: "test".into(),
            prefix: "/topology/".into(),
            change_rx,
            resync_rx,
            registration,
            handler: Journal { seen: seen_tx },
            metrics: Arc::new(ConsumerMetrics::default()),
            state_tx,
            last_revision: 0,
            _payload: PhantomData,
        };
        let task = tokio::spawn(consumer.run(CancellationToken::new()));

        change_tx
            .send(ChangeEvent::put(
                "/topology/index",
                datasync_proto::encode_value(&2u32).unwrap(),
                None,
                5,
            ))
            .await
            .unwrap();
        assert_eq!(
            seen.recv().await.unwrap(),
            Seen::Change(5, "/topology/index".to_string())
        );

        let (event, ack_rx) = ResyncEvent::new("test", "/topology/", 3, vec![]);
        resync_tx.send(event).await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), Seen::Resync(3, vec![]));
        ack_rx.await.unwrap();

        drop(change_tx);
        drop(resync_tx);
        task.await.unwrap();
    }
}
