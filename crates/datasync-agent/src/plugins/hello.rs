//! Minimal plugin that only logs its lifecycle.

use async_trait::async_trait;
use tracing::info;

use crate::agent::Plugin;
use crate::error::Error;

/// Plugin name.
pub const HELLO_PLUGIN_NAME: &str = "helloworld-plugin";

/// Logs a greeting on start.
#[derive(Debug, Default)]
pub struct HelloWorldPlugin {
    started: bool,
}

impl HelloWorldPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[async_trait]
impl Plugin for HelloWorldPlugin {
    fn name(&self) -> &str {
        HELLO_PLUGIN_NAME
    }

    async fn start(&mut self) -> Result<(), Error> {
        info!(plugin = HELLO_PLUGIN_NAME, "Hello World!!!");
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.started = false;
        info!(plugin = HELLO_PLUGIN_NAME, "goodbye");
        Ok(())
    }
}
