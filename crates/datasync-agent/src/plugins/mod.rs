//! Plugins run by the agent.

pub mod hello;
pub mod topology;

pub use hello::{HelloWorldPlugin, HELLO_PLUGIN_NAME};
pub use topology::{
    publish_topology, TopologyPlugin, TopologyView, DEFAULT_PUBLISH_INTERVAL, INDEX_KEY,
    TOPOLOGY_PLUGIN_NAME,
};
