//! Change type tags carried by watch events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Key was inserted or updated.
    Put,
    /// Key was removed.
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Put => f.write_str("put"),
            ChangeType::Delete => f.write_str("delete"),
        }
    }
}
