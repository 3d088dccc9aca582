//! Agent error types.

use std::time::Duration;

use thiserror::Error;

/// Agent errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Store, watch or codec error.
    #[error("datasync error: {0}")]
    Core(#[from] datasync_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A plugin failed to start or stop.
    #[error("plugin {name} failed: {source}")]
    Plugin {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// Plugins did not finish starting in time.
    #[error("agent did not start within {0:?}")]
    StartupTimeout(Duration),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Wrap an error with the name of the plugin it came from.
    pub fn plugin(name: impl Into<String>, source: Error) -> Self {
        Error::Plugin {
            name: name.into(),
            source: Box::new(source),
        }
    }
}
