use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::flow_run::{RunId, RunStatus};
use crate::EngineError;

/// A fire-and-forget progress notification emitted on every run transition
#[derive(Debug, Clone, PartialEq)]
pub struct RunProgressUpdate {
    /// The run that transitioned
    pub run_id: RunId,

    /// The status after the transition
    pub status: RunStatus,

    /// Number of step outputs recorded so far
    pub steps_completed: usize,

    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

/// External subscriber for run progress
///
/// Emission failures are logged by the caller and never fail the transition
/// that produced them.
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    /// Deliver one progress update
    async fn notify(&self, update: RunProgressUpdate) -> Result<(), EngineError>;
}

/// Notifier that only logs; the default when nobody subscribes
pub struct TracingProgressNotifier;

#[async_trait]
impl ProgressNotifier for TracingProgressNotifier {
    async fn notify(&self, update: RunProgressUpdate) -> Result<(), EngineError> {
        tracing::debug!(
            run_id = %update.run_id.0,
            status = ?update.status,
            steps_completed = update.steps_completed,
            "run progress"
        );
        Ok(())
    }
}

/// Notifier backed by a tokio broadcast channel, used by tests and by
/// in-process subscribers such as websocket bridges
pub struct BroadcastProgressNotifier {
    tx: broadcast::Sender<RunProgressUpdate>,
}

impl BroadcastProgressNotifier {
    /// Create a notifier with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<RunProgressUpdate> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ProgressNotifier for BroadcastProgressNotifier {
    async fn notify(&self, update: RunProgressUpdate) -> Result<(), EngineError> {
        // A send error only means there are no subscribers right now
        let _ = self.tx.send(update);
        Ok(())
    }
}
