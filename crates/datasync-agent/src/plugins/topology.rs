//! Topology plugin.
//!
//! Watches the topology prefix, keeps a local [`TopologyView`] in sync with
//! it, and publishes two sample topologies to the index key so the watch has
//! something to observe. When a run time is configured it asks the agent to
//! shut down once that time has passed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use datasync_core::{
    publish, ChangeConsumer, ChangeHandler, ConsumerMetrics, DecodedChange, DecodedResync,
    Publisher, Watcher,
};
use datasync_proto::{ChangeType, Topology};

use crate::agent::Plugin;
use crate::config::AgentConfig;
use crate::error::Error;

/// Plugin name, also used as the watch subscriber name.
pub const TOPOLOGY_PLUGIN_NAME: &str = "topology-plugin";

/// Key under the prefix that the sample topologies are written to.
pub const INDEX_KEY: &str = "index";

/// Delay before each sample write.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// A key's latest known state. `topology` is `None` once the key is deleted;
/// the entry is kept so an older snapshot cannot bring the key back.
#[derive(Debug, Clone)]
struct ViewEntry {
    revision: u64,
    topology: Option<Topology>,
}

#[derive(Debug, Default)]
struct ViewState {
    entries: BTreeMap<String, ViewEntry>,
    changes_applied: u64,
    resyncs: u64,
}

/// Local copy of every topology under the watched prefix.
///
/// Each key remembers the revision it was last written at, so a snapshot
/// taken before a change that was already applied does not undo it.
#[derive(Debug, Clone, Default)]
pub struct TopologyView {
    state: Arc<RwLock<ViewState>>,
}

impl TopologyView {
    pub fn get(&self, key: &str) -> Option<Topology> {
        self.state
            .read()
            .entries
            .get(key)
            .and_then(|entry| entry.topology.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.topology.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|entry| entry.topology.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of change events applied.
    pub fn changes_applied(&self) -> u64 {
        self.state.read().changes_applied
    }

    /// Number of snapshots applied.
    pub fn resyncs(&self) -> u64 {
        self.state.read().resyncs
    }

    fn apply(&self, change: DecodedChange<Topology>) {
        let mut state = self.state.write();
        if let Some(current) = state.entries.get(&change.key) {
            if current.revision > change.revision {
                debug!(key = %change.key, revision = change.revision, "skipping stale change");
                return;
            }
        }

        let topology = match change.change_type {
            ChangeType::Put => change.value,
            ChangeType::Delete => None,
        };
        state.entries.insert(
            change.key,
            ViewEntry {
                revision: change.revision,
                topology,
            },
        );
        state.changes_applied += 1;
    }

    fn replace(&self, resync: DecodedResync<Topology>) {
        let mut state = self.state.write();
        let mut entries: BTreeMap<String, ViewEntry> = resync
            .entries
            .into_iter()
            .map(|(key, topology)| {
                let entry = ViewEntry {
                    revision: resync.revision,
                    topology: Some(topology),
                };
                (key, entry)
            })
            .collect();

        // Keys changed after the snapshot keep their newer state.
        let mut kept = 0;
        for (key, entry) in std::mem::take(&mut state.entries) {
            if entry.revision > resync.revision {
                entries.insert(key, entry);
                kept += 1;
            }
        }
        if kept > 0 {
            debug!(kept, revision = resync.revision, "kept changes newer than snapshot");
        }

        state.entries = entries;
        state.resyncs += 1;
    }
}

/// Feeds decoded events into a [`TopologyView`].
struct ViewHandler {
    view: TopologyView,
}

impl ChangeHandler<Topology> for ViewHandler {
    fn on_change(&mut self, change: DecodedChange<Topology>) {
        info!(
            key = %change.key,
            change_type = %change.change_type,
            bridge = ?change.value.as_ref().and_then(|t| t.bridge_name()),
            previous_bridge = ?change.prev_value.as_ref().and_then(|t| t.bridge_name()),
            taps = change.value.as_ref().map(|t| t.taps.len()).unwrap_or(0),
            "topology changed"
        );
        self.view.apply(change);
    }

    fn on_resync(&mut self, resync: DecodedResync<Topology>) {
        info!(topologies = resync.entries.len(), revision = resync.revision, "topology resync");
        self.view.replace(resync);
    }
}

/// Write a topology through the publisher.
pub async fn publish_topology(
    publisher: &dyn Publisher,
    key: &str,
    topology: &Topology,
) -> Result<(), Error> {
    debug!(key, bridge = ?topology.bridge_name(), taps = topology.taps.len(), "publishing topology");
    publish(publisher, key, topology).await?;
    Ok(())
}

/// Publishes sample topologies and watches the topology prefix.
pub struct TopologyPlugin {
    watcher: Arc<dyn Watcher>,
    publisher: Arc<dyn Publisher>,
    prefix: String,
    channel_capacity: usize,
    publish_interval: Duration,
    run_for: Option<Duration>,
    /// Agent-wide close signal.
    close: CancellationToken,
    /// Stops this plugin's consumer and background tasks.
    cancel: CancellationToken,
    view: TopologyView,
    metrics: Option<Arc<ConsumerMetrics>>,
    consumer: Option<JoinHandle<ViewHandler>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TopologyPlugin {
    /// Create the plugin. `close` is cancelled when the run time elapses.
    pub fn new(
        watcher: Arc<dyn Watcher>,
        publisher: Arc<dyn Publisher>,
        config: &AgentConfig,
        close: CancellationToken,
    ) -> Self {
        Self {
            watcher,
            publisher,
            prefix: config.watch_prefix.clone(),
            channel_capacity: config.channel_capacity,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            run_for: config.run_for,
            close,
            cancel: CancellationToken::new(),
            view: TopologyView::default(),
            metrics: None,
            consumer: None,
            tasks: Vec::new(),
        }
    }

    /// Set the delay before each sample write.
    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    /// Full key the sample topologies are written to.
    pub fn index_key(&self) -> String {
        format!("{}{}", self.prefix, INDEX_KEY)
    }

    pub fn view(&self) -> TopologyView {
        self.view.clone()
    }

    /// Consumer counters, once started.
    pub fn metrics(&self) -> Option<Arc<ConsumerMetrics>> {
        self.metrics.clone()
    }

    fn spawn_writer(&mut self) {
        let publisher = Arc::clone(&self.publisher);
        let key = self.index_key();
        let interval = self.publish_interval;
        let cancel = self.cancel.clone();

        self.tasks.push(tokio::spawn(async move {
            for id in [1, 2] {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = publish_topology(publisher.as_ref(), &key, &Topology::sample(id)).await {
                    error!(key = %key, error = %e, "failed to publish topology");
                    return;
                }
            }
        }));
    }

    fn spawn_close_timer(&mut self, run_for: Duration) {
        let close = self.close.clone();
        let cancel = self.cancel.clone();

        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(run_for) => {
                    info!("topology plugin finished, sending shutdown");
                    close.cancel();
                }
            }
        }));
    }
}

#[async_trait]
impl Plugin for TopologyPlugin {
    fn name(&self) -> &str {
        TOPOLOGY_PLUGIN_NAME
    }

    async fn start(&mut self) -> Result<(), Error> {
        self.cancel = CancellationToken::new();

        let consumer = ChangeConsumer::<Topology, _>::subscribe(
            self.watcher.as_ref(),
            TOPOLOGY_PLUGIN_NAME,
            &self.prefix,
            self.channel_capacity,
            ViewHandler {
                view: self.view.clone(),
            },
        )
        .await?;
        self.metrics = Some(consumer.metrics());
        self.consumer = Some(tokio::spawn(consumer.run(self.cancel.clone())));

        info!(prefix = %self.prefix, "topology plugin initialized properly");

        self.spawn_writer();
        if let Some(run_for) = self.run_for {
            self.spawn_close_timer(run_for);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "topology background task failed");
            }
        }

        if let Some(consumer) = self.consumer.take() {
            consumer.await?;
        }

        info!(
            topologies = self.view.len(),
            changes_applied = self.view.changes_applied(),
            decode_failures = self.metrics.as_ref().map(|m| m.decode_failures()).unwrap_or(0),
            "topology plugin stopped"
        );
        Ok(())
    }
}
