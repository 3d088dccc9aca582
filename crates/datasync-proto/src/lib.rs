//! datasync payload types and value codec.
//!
//! This crate defines what travels through the key-value store: the change
//! type tag attached to watch events, the JSON value codec, and the topology
//! payload used by the agent.
//!
//! # Modules
//!
//! - [`change`] - Change type tags (`Put` / `Delete`)
//! - [`codec`] - Value encoding and typed decoding
//! - [`topology`] - Topology payload model
//! - [`error`] - Codec error types

pub mod change;
pub mod codec;
pub mod error;
pub mod topology;

pub use change::ChangeType;
pub use codec::{decode_value, encode_value};
pub use error::Error;
pub use topology::{Bridge, Interface, IpAddress, Tap, Topology};
