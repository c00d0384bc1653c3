//! Dispatch of step executions to worker machines
//!
//! The gateway enforces the payload ceiling and the wall-clock deadline on
//! this side of the wire, so a stalled executor can never wedge a run. The
//! `EngineClient` seam carries the actual transport; tests script it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::fleet::{DispatchStrategy, WorkerFleetRegistry};
use crate::domain::flow_run::CorrelationId;
use crate::domain::worker::WorkerMachine;
use crate::{DataPacket, EngineError};

/// Hard ceiling on serialized engine request payloads (6 MiB)
pub const MAX_ENGINE_PAYLOAD_BYTES: usize = 6 * 1024 * 1024;

/// What the executor is being asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineOperationType {
    /// Execute one action step
    ExecuteStep,
    /// Evaluate the trigger against a payload
    ExecuteTrigger,
}

/// One request handed to a worker machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    /// Operation discriminator
    pub operation_type: EngineOperationType,

    /// Step input, already resolved against the run context
    pub input: DataPacket,

    /// Absolute wall-clock deadline; the executor aborts past it
    pub deadline: DateTime<Utc>,
}

/// What the executor reported back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineResponse {
    /// The step completed with an output
    Ok {
        /// Step output
        output: DataPacket,
    },
    /// The step failed with an application error
    Error {
        /// Human-readable failure message
        message: String,
    },
    /// The step requested a pause awaiting an external callback
    Paused {
        /// Key the external party must present to resume
        correlation_id: CorrelationId,
        /// Why the step paused
        reason: String,
    },
}

/// Transport to one worker machine
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Execute a request on the given machine
    async fn execute(
        &self,
        worker: &WorkerMachine,
        request: EngineRequest,
    ) -> Result<EngineResponse, EngineError>;
}

/// Routes engine requests to live workers with deadline and size enforcement
pub struct EngineGateway {
    client: Arc<dyn EngineClient>,
    fleet: Arc<WorkerFleetRegistry>,
    strategy: Arc<dyn DispatchStrategy>,
}

impl EngineGateway {
    /// Create a gateway over the given transport, fleet and strategy
    pub fn new(
        client: Arc<dyn EngineClient>,
        fleet: Arc<WorkerFleetRegistry>,
        strategy: Arc<dyn DispatchStrategy>,
    ) -> Self {
        Self {
            client,
            fleet,
            strategy,
        }
    }

    /// Dispatch one request, bounding it by the request's own deadline
    ///
    /// Oversized payloads and already-expired deadlines are rejected before
    /// any worker is contacted.
    pub async fn execute(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        let payload_size = serde_json::to_vec(&request)?.len();
        if payload_size > MAX_ENGINE_PAYLOAD_BYTES {
            return Err(EngineError::PayloadTooLarge(payload_size));
        }

        let remaining = (request.deadline - Utc::now())
            .to_std()
            .map_err(|_| EngineError::DeadlineExceeded("deadline already elapsed".to_string()))?;

        let worker = self
            .fleet
            .select(self.strategy.as_ref())
            .await?
            .ok_or(EngineError::NoWorkerAvailable)?;

        debug!(
            worker = %worker.principal.0,
            operation = ?request.operation_type,
            payload_size,
            "dispatching engine request"
        );

        match tokio::time::timeout(remaining, self.client.execute(&worker, request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(worker = %worker.principal.0, "engine request overran its deadline");
                Err(EngineError::DeadlineExceeded(worker.principal.0.clone()))
            }
        }
    }
}
