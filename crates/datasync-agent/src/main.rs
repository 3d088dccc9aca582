//! datasync agent binary.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datasync_agent::{Agent, Args, HelloWorldPlugin, TopologyPlugin};
use datasync_core::KvStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datasync_agent=info,datasync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting datasync agent");

    let args = Args::parse();
    let config = args.into_config()?;

    tracing::info!(
        data_path = %config.store.path.display(),
        temporary = config.store.temporary,
        watch_prefix = %config.watch_prefix,
        run_for = ?config.run_for,
        "configuration loaded"
    );

    let store = KvStore::open(config.store.clone())?;
    let shared = Arc::new(store.clone());
    let close = CancellationToken::new();

    let agent = Agent::new(config.startup_timeout)
        .with_plugin(HelloWorldPlugin::new())
        .with_plugin(TopologyPlugin::new(
            shared.clone(),
            shared,
            &config,
            close.clone(),
        ));

    let result = agent.run_until_shutdown(close).await;

    if let Err(e) = store.close().await {
        tracing::error!(error = %e, "failed to close store");
    }

    match result {
        Ok(()) => {
            tracing::info!("agent shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "agent error");
            Err(e.into())
        }
    }
}
