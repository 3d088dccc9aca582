//! Watch and publish capabilities.
//!
//! Plugins depend on these traits rather than on a concrete store, so the
//! consumer can be driven by the embedded [`KvStore`](crate::KvStore) or by
//! any other backend that delivers the same events.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use datasync_proto::encode_value;

use crate::error::Error;
use crate::event::{ChangeEvent, ResyncEvent};
use crate::registry::WatchRegistration;

/// Delivers change and resync notifications for keys under a prefix.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Register `subscriber` for every key starting with `key_prefix`.
    ///
    /// Change events are sent on `change_tx` in write order; resync snapshots
    /// on `resync_tx`. The watch lasts as long as the returned registration.
    async fn watch(
        &self,
        subscriber: &str,
        change_tx: mpsc::Sender<ChangeEvent>,
        resync_tx: mpsc::Sender<ResyncEvent>,
        key_prefix: &str,
    ) -> Result<WatchRegistration, Error>;
}

/// Writes key/value pairs, triggering watch notifications.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Store an already encoded value under `key`.
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, Error>;
}

/// Typed helpers on top of [`Publisher`].
#[async_trait]
pub trait PublisherExt: Publisher {
    /// Encode `value` and store it under `key`.
    async fn put<T>(&self, key: &str, value: &T) -> Result<(), Error>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = encode_value(value)?;
        self.put_raw(key, bytes).await
    }
}

impl<P: Publisher + ?Sized> PublisherExt for P {}
