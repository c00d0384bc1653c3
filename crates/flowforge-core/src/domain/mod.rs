/// Flows, versions and the step tree
pub mod flow;

/// Flow run aggregate and its state machine
pub mod flow_run;

/// Typed mutation operations and the pure applier
pub mod operations;

/// Run progress notifications
pub mod events;

/// Repository traits implemented by storage crates
pub mod repository;

/// Webhook simulation record
pub mod webhook_simulation;

/// Worker machine snapshots
pub mod worker;
