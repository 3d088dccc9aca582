//! Value encoding for the key-value store.
//!
//! Values are stored as JSON so any `serde` type can be written by a
//! publisher and decoded into the consumer's own payload type.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// Encode a value into its stored byte form.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode stored bytes into a typed payload.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}
