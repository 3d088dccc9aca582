//! Watch subscription registry.
//!
//! Tracks every active watch with its key prefix and the channels events are
//! delivered on. The store consults the registry on each write to find the
//! subscribers whose prefix matches the written key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{ChangeEvent, ResyncEvent};

/// A registered watch.
#[derive(Debug)]
pub(crate) struct WatchEntry {
    pub(crate) id: u64,
    pub(crate) subscriber: String,
    pub(crate) prefix: String,
    pub(crate) change_tx: mpsc::Sender<ChangeEvent>,
    pub(crate) resync_tx: mpsc::Sender<ResyncEvent>,
    pub(crate) created_at: Instant,
    pub(crate) events_sent: AtomicU64,
}

impl WatchEntry {
    fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }
}

/// Target for a single change delivery.
pub(crate) struct ChangeTarget {
    pub(crate) id: u64,
    pub(crate) subscriber: String,
    pub(crate) change_tx: mpsc::Sender<ChangeEvent>,
}

/// Target for a single resync delivery.
pub(crate) struct ResyncTarget {
    pub(crate) id: u64,
    pub(crate) subscriber: String,
    pub(crate) prefix: String,
    pub(crate) resync_tx: mpsc::Sender<ResyncEvent>,
}

/// Registry of active watches keyed by registration ID.
#[derive(Debug)]
pub(crate) struct Registry {
    entries: RwLock<HashMap<u64, WatchEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a watch and return its ID.
    pub(crate) fn register(
        &self,
        subscriber: &str,
        prefix: &str,
        change_tx: mpsc::Sender<ChangeEvent>,
        resync_tx: mpsc::Sender<ResyncEvent>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = WatchEntry {
            id,
            subscriber: subscriber.to_string(),
            prefix: prefix.to_string(),
            change_tx,
            resync_tx,
            created_at: Instant::now(),
            events_sent: AtomicU64::new(0),
        };
        self.entries.write().insert(id, entry);

        debug!(watch_id = id, subscriber, prefix, "watch registered");
        id
    }

    /// Remove a watch. Dropping the entry closes its channels.
    pub(crate) fn unregister(&self, id: u64) -> bool {
        match self.entries.write().remove(&id) {
            Some(entry) => {
                debug!(
                    watch_id = id,
                    subscriber = %entry.subscriber,
                    prefix = %entry.prefix,
                    events_sent = entry.events_sent.load(Ordering::Relaxed),
                    age_ms = entry.created_at.elapsed().as_millis() as u64,
                    "watch unregistered"
                );
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Watches whose prefix matches `key`, in registration order.
    pub(crate) fn change_targets(&self, key: &str) -> Vec<ChangeTarget> {
        let entries = self.entries.read();
        let mut targets: Vec<ChangeTarget> = entries
            .values()
            .filter(|entry| entry.matches(key))
            .map(|entry| ChangeTarget {
                id: entry.id,
                subscriber: entry.subscriber.clone(),
                change_tx: entry.change_tx.clone(),
            })
            .collect();
        targets.sort_by_key(|t| t.id);
        targets
    }

    /// Every registered watch, in registration order.
    pub(crate) fn resync_targets(&self) -> Vec<ResyncTarget> {
        let entries = self.entries.read();
        let mut targets: Vec<ResyncTarget> = entries
            .values()
            .map(|entry| ResyncTarget {
                id: entry.id,
                subscriber: entry.subscriber.clone(),
                prefix: entry.prefix.clone(),
                resync_tx: entry.resync_tx.clone(),
            })
            .collect();
        targets.sort_by_key(|t| t.id);
        targets
    }

    pub(crate) fn record_delivery(&self, id: u64) {
        if let Some(entry) = self.entries.read().get(&id) {
            entry.events_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every watch.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        count
    }
}

/// Handle for an active watch subscription.
///
/// The watch stays registered until [`WatchRegistration::close`] is called or
/// the handle is dropped. Closing drops the store's side of both event
/// channels, so the subscriber's receivers observe the end of the stream.
#[derive(Debug)]
pub struct WatchRegistration {
    id: u64,
    subscriber: String,
    prefix: String,
    registry: Weak<Registry>,
    closed: bool,
}

impl WatchRegistration {
    pub(crate) fn new(id: u64, subscriber: &str, prefix: &str, registry: &Arc<Registry>) -> Self {
        Self {
            id,
            subscriber: subscriber.to_string(),
            prefix: prefix.to_string(),
            registry: Arc::downgrade(registry),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the watch is still registered with the store.
    pub fn is_active(&self) -> bool {
        !self.closed
            && self
                .registry
                .upgrade()
                .map(|registry| registry.contains(self.id))
                .unwrap_or(false)
    }

    /// Unregister the watch. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        self.close();
    }
}
