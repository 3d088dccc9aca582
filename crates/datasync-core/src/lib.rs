//! datasync core: watch/publish capabilities and the change-event consumer.
//!
//! - [`Watcher`] / [`Publisher`] - capabilities plugins depend on
//! - [`ChangeEvent`] / [`ResyncEvent`] - events delivered to watchers
//! - [`WatchRegistration`] - handle for an active watch
//! - [`KvStore`] - sled-backed store implementing both capabilities
//! - [`ChangeConsumer`] - event loop decoding changes into a payload type

pub mod capability;
pub mod consumer;
pub mod error;
pub mod event;
mod registry;
pub mod store;

pub use capability::{Publisher, PublisherExt, Watcher};
pub use consumer::{
    publish, ChangeConsumer, ChangeHandler, ConsumerMetrics, ConsumerState, DecodedChange,
    DecodedResync, DEFAULT_CHANNEL_CAPACITY,
};
pub use error::Error;
pub use event::{ChangeEvent, ResyncEntry, ResyncEvent};
pub use registry::WatchRegistration;
pub use store::{KvStore, ResyncOutcome, ResyncReport, StoreConfig};

