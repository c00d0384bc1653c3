//! In-memory state store implementation for the FlowForge engine
//!
//! This crate provides in-memory implementations of the repository
//! interfaces defined in the flowforge-core crate. It is primarily useful
//! for development, testing, and single-node deployments where persistence
//! is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod repositories;
pub use repositories::{
    InMemoryFlowRepository, InMemoryFlowRunRepository, InMemoryWorkerMachineRepository,
};
