/// Engine request dispatch with deadline and payload enforcement
pub mod engine;

/// Worker fleet registry and dispatch strategies
pub mod fleet;

/// Flow mutation and version lifecycle service
pub mod flow_service;

/// Lease-based edit locking
pub mod lock;

/// Run lifecycle orchestration
pub mod run_service;

/// Webhook simulation capture windows
pub mod simulation;
