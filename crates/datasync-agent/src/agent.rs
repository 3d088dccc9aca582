//! Plugin lifecycle.
//!
//! An [`Agent`] owns a list of plugins, starts them in registration order and
//! stops them in reverse order. If a plugin fails to start, every plugin that
//! already started is stopped again before the error is returned.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Error;

/// A unit of functionality with a start/stop lifecycle.
#[async_trait]
pub trait Plugin: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Acquire resources and spawn background work.
    async fn start(&mut self) -> Result<(), Error>;

    /// Release everything acquired in `start`.
    async fn stop(&mut self) -> Result<(), Error>;
}

/// Runs a set of plugins.
pub struct Agent {
    plugins: Vec<Box<dyn Plugin>>,
    /// Number of plugins, from the front, that are currently started.
    started: usize,
    startup_timeout: Duration,
}

impl Agent {
    /// Create an agent whose plugins must start within `startup_timeout`.
    pub fn new(startup_timeout: Duration) -> Self {
        Self {
            plugins: Vec::new(),
            started: 0,
            startup_timeout,
        }
    }

    /// Add a plugin. Plugins start in the order they are added.
    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Number of plugins currently started.
    pub fn started_count(&self) -> usize {
        self.started
    }

    /// Start every plugin.
    ///
    /// On failure or timeout the plugins already started are stopped in
    /// reverse order and the error is returned.
    pub async fn start(&mut self) -> Result<(), Error> {
        info!(plugins = self.plugins.len(), "starting agent");

        let timeout = self.startup_timeout;
        let result = match tokio::time::timeout(timeout, self.start_plugins()).await {
            Ok(result) => result,
            Err(_) => Err(Error::StartupTimeout(timeout)),
        };

        if let Err(e) = result {
            error!(error = %e, "agent failed to start, stopping started plugins");
            // Rollback errors are logged by stop(); the start error wins.
            let _ = self.stop().await;
            return Err(e);
        }

        info!("all plugins started");
        Ok(())
    }

    async fn start_plugins(&mut self) -> Result<(), Error> {
        while self.started < self.plugins.len() {
            let plugin = &mut self.plugins[self.started];
            info!(plugin = plugin.name(), "starting plugin");
            plugin
                .start()
                .await
                .map_err(|e| Error::plugin(plugin.name(), e))?;
            self.started += 1;
        }
        Ok(())
    }

    /// Stop every started plugin in reverse order.
    ///
    /// All plugins are stopped even if some fail; the first failure is
    /// returned.
    pub async fn stop(&mut self) -> Result<(), Error> {
        let mut first_error = None;

        while self.started > 0 {
            self.started -= 1;
            let plugin = &mut self.plugins[self.started];
            info!(plugin = plugin.name(), "stopping plugin");
            if let Err(e) = plugin.stop().await {
                warn!(plugin = plugin.name(), error = %e, "plugin failed to stop");
                if first_error.is_none() {
                    first_error = Some(Error::plugin(plugin.name(), e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("agent stopped");
                Ok(())
            }
        }
    }

    /// Start, wait for ctrl-c or `close`, then stop.
    pub async fn run_until_shutdown(mut self, close: CancellationToken) -> Result<(), Error> {
        self.start().await?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for ctrl+c");
                }
                info!("received shutdown signal");
            }
            _ = close.cancelled() => {
                info!("close requested by plugin");
            }
        }

        self.stop().await
    }
}
