//! datasync agent: runs plugins against a watchable key-value store.
//!
//! The agent starts a [`HelloWorldPlugin`] and a [`TopologyPlugin`] over a
//! [`datasync_core::KvStore`]. The topology plugin publishes sample network
//! topologies and watches them arrive through its change consumer.

pub mod agent;
pub mod config;
pub mod error;
pub mod plugins;

pub use agent::{Agent, Plugin};
pub use config::{AgentConfig, Args, FileConfig};
pub use error::Error;
pub use plugins::{HelloWorldPlugin, TopologyPlugin, TopologyView};
