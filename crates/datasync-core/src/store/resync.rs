//! Resync delivery and acknowledgment tracking.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::event::ResyncEvent;

/// How a single subscriber responded to a resync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// The subscriber acknowledged the snapshot.
    Acknowledged,
    /// The event was dropped without an acknowledgment.
    Unacknowledged,
    /// No acknowledgment arrived within the resync timeout.
    TimedOut,
    /// The subscriber's resync channel is closed.
    Disconnected,
}

impl fmt::Display for ResyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResyncOutcome::Acknowledged => "acknowledged",
            ResyncOutcome::Unacknowledged => "unacknowledged",
            ResyncOutcome::TimedOut => "timed out",
            ResyncOutcome::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Result of a resync round across all subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Outcome per subscriber, in registration order.
    pub outcomes: Vec<(String, ResyncOutcome)>,
}

impl ResyncReport {
    /// Whether every subscriber acknowledged.
    pub fn all_acknowledged(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| *outcome == ResyncOutcome::Acknowledged)
    }

    /// Number of subscribers with the given outcome.
    pub fn count(&self, outcome: ResyncOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    /// Outcome for a subscriber, if it took part in the round.
    pub fn outcome_for(&self, subscriber: &str) -> Option<ResyncOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == subscriber)
            .map(|(_, outcome)| *outcome)
    }
}

/// Send a resync event and wait for its acknowledgment.
///
/// The timeout covers both the send (the channel may be full) and the wait
/// for the acknowledgment.
pub(crate) async fn deliver_resync(
    subscriber: &str,
    resync_tx: mpsc::Sender<ResyncEvent>,
    event: ResyncEvent,
    ack_rx: oneshot::Receiver<()>,
    timeout: Duration,
) -> ResyncOutcome {
    let round = async {
        if resync_tx.send(event).await.is_err() {
            return ResyncOutcome::Disconnected;
        }
        ack_outcome(ack_rx).await
    };

    let outcome = tokio::time::timeout(timeout, round)
        .await
        .unwrap_or(ResyncOutcome::TimedOut);
    log_outcome(subscriber, outcome)
}

/// Wait for the acknowledgment of a resync event that is already queued.
pub(crate) async fn await_ack(
    subscriber: &str,
    ack_rx: oneshot::Receiver<()>,
    timeout: Duration,
) -> ResyncOutcome {
    let outcome = tokio::time::timeout(timeout, ack_outcome(ack_rx))
        .await
        .unwrap_or(ResyncOutcome::TimedOut);
    log_outcome(subscriber, outcome)
}

async fn ack_outcome(ack_rx: oneshot::Receiver<()>) -> ResyncOutcome {
    match ack_rx.await {
        Ok(()) => ResyncOutcome::Acknowledged,
        Err(_) => ResyncOutcome::Unacknowledged,
    }
}

fn log_outcome(subscriber: &str, outcome: ResyncOutcome) -> ResyncOutcome {
    match outcome {
        ResyncOutcome::Acknowledged => debug!(subscriber, "resync acknowledged"),
        other => warn!(subscriber, outcome = %other, "resync not acknowledged"),
    }
    outcome
}
