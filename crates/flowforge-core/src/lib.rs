//!
//! FlowForge Core - Flow version mutation and run orchestration engine
//!
//! This crate defines the domain model, repository interfaces, and
//! application services for mutating flow versions and orchestrating
//! flow runs. Storage crates implement the repository traits it exports.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - core application logic
pub mod application;

/// Core types and traits
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::EngineError;
pub use types::DataPacket;

// Re-export main API types for easy use
pub use domain::flow::{
    Flow, FlowId, FlowVersion, FlowVersionId, FlowVersionState, ProjectId, Step, StepKind, Trigger,
    TRIGGER_STEP_NAME,
};
pub use domain::flow_run::{
    CorrelationId, FlowRun, RetryStrategy, RunId, RunStatus, StepOutput, StepOutputStatus,
    TerminationReason,
};
pub use domain::operations::{FlowOperation, FlowTemplate, StepLocation};
pub use domain::repository::{FlowRepository, FlowRunRepository, WorkerMachineRepository};
pub use domain::worker::{WorkerMachine, WorkerPrincipal};

// Application services
pub use application::engine::{EngineClient, EngineGateway, EngineRequest, EngineResponse};
pub use application::fleet::WorkerFleetRegistry;
pub use application::flow_service::FlowMutationService;
pub use application::lock::{LeaseCoordinator, LocalLeaseCoordinator};
pub use application::run_service::RunLifecycleManager;
pub use application::simulation::WebhookSimulationService;
