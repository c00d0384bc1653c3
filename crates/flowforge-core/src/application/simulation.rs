//! Webhook simulation capture windows
//!
//! Simulations are ephemeral and live in a service-owned map rather than
//! behind a repository: they never survive a restart and carry no history.
//! Expiry is lazy; expired records are removed on the read that notices them.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::domain::flow::{FlowId, ProjectId};
use crate::domain::webhook_simulation::WebhookSimulation;
use crate::EngineError;

/// Default lifetime of a capture window
pub const DEFAULT_SIMULATION_TTL_SECS: i64 = 15 * 60;

/// Manages at most one live capture window per flow
pub struct WebhookSimulationService {
    simulations: DashMap<String, WebhookSimulation>,
    ttl: Duration,
}

impl WebhookSimulationService {
    /// Create a service with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_SIMULATION_TTL_SECS))
    }

    /// Create a service with an explicit TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            simulations: DashMap::new(),
            ttl,
        }
    }

    /// Open a capture window, superseding any existing one for the flow
    pub fn create(&self, flow_id: FlowId, project_id: ProjectId) -> WebhookSimulation {
        let simulation = WebhookSimulation::new(flow_id, project_id);
        debug!(flow_id = %simulation.flow_id.0, "opened webhook simulation");
        self.simulations
            .insert(simulation.flow_id.0.clone(), simulation.clone());
        simulation
    }

    /// Fetch the live window for a flow within the given project
    ///
    /// Expired windows are removed here and reported as not found. A window
    /// owned by another project is also not found rather than forbidden, so
    /// flow ids cannot be probed across projects.
    pub fn get(
        &self,
        flow_id: &FlowId,
        project_id: &ProjectId,
    ) -> Result<WebhookSimulation, EngineError> {
        let expired = match self.simulations.get(&flow_id.0) {
            Some(entry) => {
                let simulation = entry.value();
                if simulation.created_at + self.ttl <= Utc::now() {
                    true
                } else if &simulation.project_id != project_id {
                    return Err(EngineError::SimulationNotFound(flow_id.0.clone()));
                } else {
                    return Ok(simulation.clone());
                }
            }
            None => return Err(EngineError::SimulationNotFound(flow_id.0.clone())),
        };

        if expired {
            self.simulations.remove(&flow_id.0);
        }
        Err(EngineError::SimulationNotFound(flow_id.0.clone()))
    }

    /// Close the capture window; a no-op when none is open
    pub fn delete(&self, flow_id: &FlowId) {
        self.simulations.remove(&flow_id.0);
    }
}

impl Default for WebhookSimulationService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (FlowId, ProjectId) {
        (FlowId("f1".to_string()), ProjectId("p1".to_string()))
    }

    #[test]
    fn test_create_then_get() {
        let service = WebhookSimulationService::new();
        let (flow_id, project_id) = ids();

        let created = service.create(flow_id.clone(), project_id.clone());
        let fetched = service.get(&flow_id, &project_id).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn test_create_supersedes_previous_window() {
        let service = WebhookSimulationService::new();
        let (flow_id, project_id) = ids();

        let first = service.create(flow_id.clone(), project_id.clone());
        let second = service.create(flow_id.clone(), project_id.clone());
        assert_ne!(first.id, second.id);

        let fetched = service.get(&flow_id, &project_id).unwrap();
        assert_eq!(fetched.id, second.id);
    }

    #[test]
    fn test_expired_window_is_not_found() {
        let service = WebhookSimulationService::with_ttl(Duration::milliseconds(-1));
        let (flow_id, project_id) = ids();

        service.create(flow_id.clone(), project_id.clone());
        let err = service.get(&flow_id, &project_id).unwrap_err();
        assert!(matches!(err, EngineError::SimulationNotFound(_)));
    }

    #[test]
    fn test_foreign_project_cannot_see_window() {
        let service = WebhookSimulationService::new();
        let (flow_id, project_id) = ids();

        service.create(flow_id.clone(), project_id);
        let err = service
            .get(&flow_id, &ProjectId("other".to_string()))
            .unwrap_err();
        assert!(matches!(err, EngineError::SimulationNotFound(_)));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let service = WebhookSimulationService::new();
        let (flow_id, project_id) = ids();

        service.create(flow_id.clone(), project_id.clone());
        service.delete(&flow_id);
        service.delete(&flow_id);
        assert!(service.get(&flow_id, &project_id).is_err());
    }
}
