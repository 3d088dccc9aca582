//! Agent configuration.
//!
//! Settings come from an optional YAML file and are then overridden by
//! command-line arguments:
//!
//! ```yaml
//! store:
//!   path: ./datasync_data
//!   flush_every_ms: 1000
//!   resync_timeout_ms: 5000
//! agent:
//!   startup_timeout_ms: 15000
//!   run_for_ms: 8000
//!   watch_prefix: /topology/
//!   channel_capacity: 16
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use datasync_core::{StoreConfig, DEFAULT_CHANNEL_CAPACITY};

use crate::error::Error;

/// Default time plugins have to start.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 15_000;

/// Default time the agent runs before shutting itself down.
pub const DEFAULT_RUN_FOR_MS: u64 = 8_000;

/// Default prefix watched by the topology plugin.
pub const DEFAULT_WATCH_PREFIX: &str = "/topology/";

/// Default data directory.
pub const DEFAULT_DATA_PATH: &str = "./datasync_data";

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Key-value store settings.
    pub store: StoreConfig,

    /// Time allowed for all plugins to start.
    pub startup_timeout: Duration,

    /// Run time before the agent shuts down on its own. None runs until
    /// interrupted.
    pub run_for: Option<Duration>,

    /// Key prefix the topology plugin watches and publishes under.
    pub watch_prefix: String,

    /// Capacity of the consumer's change and resync channels.
    pub channel_capacity: usize,
}

impl AgentConfig {
    /// Create a configuration storing data at `data_path`.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::new(data_path),
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            run_for: Some(Duration::from_millis(DEFAULT_RUN_FOR_MS)),
            watch_prefix: DEFAULT_WATCH_PREFIX.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Use a temporary store.
    pub fn temporary() -> Self {
        Self {
            store: StoreConfig::temporary(),
            ..Self::new(DEFAULT_DATA_PATH)
        }
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the run time.
    pub fn with_run_for(mut self, run_for: Duration) -> Self {
        self.run_for = Some(run_for);
        self
    }

    /// Run until interrupted.
    pub fn without_run_limit(mut self) -> Self {
        self.run_for = None;
        self
    }

    /// Set the watched prefix.
    pub fn with_watch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.watch_prefix = prefix.into();
        self
    }

    /// Set the consumer channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Check the configuration for values the agent cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.watch_prefix.is_empty() {
            return Err(Error::Config("watch prefix must not be empty".into()));
        }
        if self.startup_timeout.is_zero() {
            return Err(Error::Config("startup timeout must be positive".into()));
        }
        if !self.store.temporary && self.store.path.as_os_str().is_empty() {
            return Err(Error::Config("store path must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_PATH)
    }
}

/// `store` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub path: PathBuf,
    pub temporary: bool,
    pub cache_capacity: u64,
    pub flush_every_ms: Option<u64>,
    pub compression: bool,
    pub resync_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        let store = StoreConfig::new(DEFAULT_DATA_PATH);
        Self {
            path: store.path,
            temporary: store.temporary,
            cache_capacity: store.cache_capacity,
            flush_every_ms: store.flush_every_ms,
            compression: store.compression,
            resync_timeout_ms: store.resync_timeout.as_millis() as u64,
        }
    }
}

/// `agent` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    pub startup_timeout_ms: u64,
    /// 0 runs until interrupted.
    pub run_for_ms: u64,
    pub watch_prefix: String,
    pub channel_capacity: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            run_for_ms: DEFAULT_RUN_FOR_MS,
            watch_prefix: DEFAULT_WATCH_PREFIX.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Contents of the YAML configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub store: StoreSection,
    pub agent: AgentSection,
}

impl FileConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Convert to agent configuration.
    pub fn into_config(self) -> AgentConfig {
        let store = StoreConfig {
            path: self.store.path,
            cache_capacity: self.store.cache_capacity,
            flush_every_ms: self.store.flush_every_ms,
            compression: self.store.compression,
            temporary: self.store.temporary,
            resync_timeout: Duration::from_millis(self.store.resync_timeout_ms),
        };

        let run_for = match self.agent.run_for_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        AgentConfig {
            store,
            startup_timeout: Duration::from_millis(self.agent.startup_timeout_ms),
            run_for,
            watch_prefix: self.agent.watch_prefix,
            channel_capacity: self.agent.channel_capacity.max(1),
        }
    }
}

/// Command-line arguments for the agent.
#[derive(Parser, Debug)]
#[command(name = "datasync-agent")]
#[command(version, about = "Topology publisher/watcher agent", long_about = None)]
pub struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the store directory (overrides the file).
    #[arg(short, long)]
    pub data_path: Option<PathBuf>,

    /// Use a temporary store that is deleted on exit.
    #[arg(long)]
    pub temporary: bool,

    /// Seconds to run before shutting down. 0 runs until ctrl-c.
    #[arg(long)]
    pub run_for: Option<u64>,

    /// Key prefix to watch and publish under.
    #[arg(long)]
    pub prefix: Option<String>,
}

impl Args {
    /// Load the configuration file, if any, and apply overrides.
    pub fn into_config(self) -> Result<AgentConfig, Error> {
        let mut config = match &self.config {
            Some(path) => FileConfig::load(path)?.into_config(),
            None => AgentConfig::default(),
        };

        if let Some(path) = self.data_path {
            config.store.path = path;
        }
        if self.temporary {
            config.store.temporary = true;
        }
        if let Some(secs) = self.run_for {
            config.run_for = match secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
        }
        if let Some(prefix) = self.prefix {
            config.watch_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }
}
