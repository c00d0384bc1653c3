//! Repository traits for the FlowForge engine
//!
//! Persistence is an external collaborator with CRUD semantics only; no
//! business logic lives behind these traits. External crates implement them
//! to provide different stores.

use async_trait::async_trait;

use super::flow::{Flow, FlowId, FlowVersion, FlowVersionId};
use super::flow_run::{CorrelationId, FlowRun, RunId, RunStatus};
use super::worker::{WorkerMachine, WorkerPrincipal};
use crate::EngineError;

/// Durable storage for flows and their versions (the VersionStore)
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Save a flow record
    async fn save_flow(&self, flow: &Flow) -> Result<(), EngineError>;

    /// Find a flow by id
    async fn find_flow(&self, id: &FlowId) -> Result<Option<Flow>, EngineError>;

    /// Delete a flow and all of its versions
    async fn delete_flow(&self, id: &FlowId) -> Result<(), EngineError>;

    /// Save a flow version
    async fn save_version(&self, version: &FlowVersion) -> Result<(), EngineError>;

    /// Find a version by id
    async fn find_version(&self, id: &FlowVersionId)
        -> Result<Option<FlowVersion>, EngineError>;

    /// Find the flow's draft head, if one is open
    async fn find_draft(&self, flow_id: &FlowId) -> Result<Option<FlowVersion>, EngineError>;

    /// List all versions of a flow, newest first
    async fn list_versions(&self, flow_id: &FlowId) -> Result<Vec<FlowVersion>, EngineError>;
}

/// Durable storage for flow runs and their step outputs
#[async_trait]
pub trait FlowRunRepository: Send + Sync {
    /// Save a run, replacing any previous record
    async fn save(&self, run: &FlowRun) -> Result<(), EngineError>;

    /// Find a run by id
    async fn find_by_id(&self, id: &RunId) -> Result<Option<FlowRun>, EngineError>;

    /// Find the paused run holding this correlation id, if any
    ///
    /// The index entry disappears as soon as the id is consumed by a resume,
    /// so late deliveries observe "not found".
    async fn find_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<FlowRun>, EngineError>;

    /// List runs with optional filters
    async fn list(
        &self,
        flow_id: Option<&FlowId>,
        status: Option<RunStatus>,
    ) -> Result<Vec<FlowRun>, EngineError>;

    /// Delete all runs of a flow (flow-delete cascade)
    async fn delete_for_flow(&self, flow_id: &FlowId) -> Result<(), EngineError>;
}

/// Storage for worker machine snapshots; single writer per principal
#[async_trait]
pub trait WorkerMachineRepository: Send + Sync {
    /// Overwrite the snapshot for this worker's principal
    async fn upsert(&self, machine: &WorkerMachine) -> Result<(), EngineError>;

    /// Find a worker by principal
    async fn find(&self, principal: &WorkerPrincipal)
        -> Result<Option<WorkerMachine>, EngineError>;

    /// List every stored snapshot, including expired ones
    async fn list_all(&self) -> Result<Vec<WorkerMachine>, EngineError>;
}
