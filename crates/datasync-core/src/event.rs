//! Change and resync events delivered to watchers.

use std::fmt;

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::warn;

use datasync_proto::{decode_value, ChangeType};

/// A single key mutation.
///
/// Produced by the store for every write under a watched prefix and consumed
/// once by the subscriber.
#[derive(Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    key: String,
    value: Option<Vec<u8>>,
    prev_value: Option<Vec<u8>>,
    change_type: ChangeType,
    revision: u64,
}

impl ChangeEvent {
    /// Create a put event.
    pub fn put(
        key: impl Into<String>,
        value: Vec<u8>,
        prev_value: Option<Vec<u8>>,
        revision: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            prev_value,
            change_type: ChangeType::Put,
            revision,
        }
    }

    /// Create a delete event.
    pub fn delete(key: impl Into<String>, prev_value: Vec<u8>, revision: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            prev_value: Some(prev_value),
            change_type: ChangeType::Delete,
            revision,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// Store revision at which the change was applied.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a previous value existed before this change.
    pub fn has_prev_value(&self) -> bool {
        self.prev_value.is_some()
    }

    /// Raw encoded new value. `None` for deletes.
    pub fn raw_value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Decode the new value. Returns `Ok(None)` for deletes.
    pub fn value<T: DeserializeOwned>(&self) -> Result<Option<T>, datasync_proto::Error> {
        self.value.as_deref().map(decode_value::<T>).transpose()
    }

    /// Decode the previous value. Returns `Ok(None)` if the key did not exist.
    pub fn prev_value<T: DeserializeOwned>(&self) -> Result<Option<T>, datasync_proto::Error> {
        self.prev_value.as_deref().map(decode_value::<T>).transpose()
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("key", &self.key)
            .field("change_type", &self.change_type)
            .field("revision", &self.revision)
            .field("value_len", &self.value.as_ref().map(Vec::len))
            .field("has_prev_value", &self.prev_value.is_some())
            .finish()
    }
}

/// One key/value pair of a resync snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncEntry {
    pub key: String,
    pub value: Vec<u8>,
}

impl ResyncEntry {
    /// Decode the entry value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, datasync_proto::Error> {
        decode_value(&self.value)
    }
}

/// Full-state snapshot of every key under a watched prefix.
///
/// The subscriber must call [`ResyncEvent::ack`] once it has applied the
/// snapshot. Dropping the event without acknowledging it is reported to the
/// store as an unacknowledged resync.
pub struct ResyncEvent {
    subscriber: String,
    prefix: String,
    revision: u64,
    entries: Vec<ResyncEntry>,
    ack_tx: Option<oneshot::Sender<()>>,
}

impl ResyncEvent {
    /// Create a resync event and the receiver that observes its acknowledgment.
    pub fn new(
        subscriber: impl Into<String>,
        prefix: impl Into<String>,
        revision: u64,
        entries: Vec<ResyncEntry>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let event = Self {
            subscriber: subscriber.into(),
            prefix: prefix.into(),
            revision,
            entries,
            ack_tx: Some(ack_tx),
        };
        (event, ack_rx)
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store revision the snapshot was taken at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn entries(&self) -> &[ResyncEntry] {
        &self.entries
    }

    /// Signal that the snapshot has been processed.
    pub fn ack(mut self) {
        if let Some(tx) = self.ack_tx.take() {
            // The store may have given up waiting; nothing left to notify.
            let _ = tx.send(());
        }
    }
}

impl Drop for ResyncEvent {
    fn drop(&mut self) {
        if self.ack_tx.is_some() {
            warn!(
                subscriber = %self.subscriber,
                prefix = %self.prefix,
                revision = self.revision,
                "resync event dropped without acknowledgment"
            );
        }
    }
}

impl fmt::Debug for ResyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResyncEvent")
            .field("subscriber", &self.subscriber)
            .field("prefix", &self.prefix)
            .field("revision", &self.revision)
            .field("entries", &self.entries.len())
            .field("acknowledged", &self.ack_tx.is_none())
            .finish()
    }
}
