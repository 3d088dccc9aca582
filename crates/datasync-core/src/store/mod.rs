//! Embedded key-value store.
//!
//! [`KvStore`] persists values in sled and implements both the
//! [`Watcher`](crate::Watcher) and [`Publisher`](crate::Publisher)
//! capabilities. Each write is dispatched as a [`ChangeEvent`](crate::ChangeEvent)
//! to every watch whose prefix matches the key; each new watch first receives
//! a [`ResyncEvent`](crate::ResyncEvent) with the current contents of its
//! prefix.

mod config;
mod engine;
mod resync;

pub use config::{StoreConfig, DEFAULT_RESYNC_TIMEOUT};
pub use engine::KvStore;
pub use resync::{ResyncOutcome, ResyncReport};
