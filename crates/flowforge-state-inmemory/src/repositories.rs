//! In-memory repository implementations backed by concurrent maps

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use flowforge_core::domain::flow::{Flow, FlowId, FlowVersion, FlowVersionId, FlowVersionState};
use flowforge_core::domain::flow_run::{CorrelationId, FlowRun, RunId, RunStatus};
use flowforge_core::domain::repository::{
    FlowRepository, FlowRunRepository, WorkerMachineRepository,
};
use flowforge_core::domain::worker::{WorkerMachine, WorkerPrincipal};
use flowforge_core::EngineError;

/// In-memory implementation of the FlowRepository
pub struct InMemoryFlowRepository {
    flows: DashMap<String, Flow>,
    versions: DashMap<String, FlowVersion>,
}

impl InMemoryFlowRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            versions: DashMap::new(),
        }
    }
}

impl Default for InMemoryFlowRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn save_flow(&self, flow: &Flow) -> Result<(), EngineError> {
        self.flows.insert(flow.id.0.clone(), flow.clone());
        Ok(())
    }

    async fn find_flow(&self, id: &FlowId) -> Result<Option<Flow>, EngineError> {
        Ok(self.flows.get(&id.0).map(|f| f.clone()))
    }

    async fn delete_flow(&self, id: &FlowId) -> Result<(), EngineError> {
        self.flows.remove(&id.0);
        self.versions.retain(|_, version| &version.flow_id != id);
        debug!(flow_id = %id.0, "deleted flow and versions");
        Ok(())
    }

    async fn save_version(&self, version: &FlowVersion) -> Result<(), EngineError> {
        self.versions.insert(version.id.0.clone(), version.clone());
        Ok(())
    }

    async fn find_version(
        &self,
        id: &FlowVersionId,
    ) -> Result<Option<FlowVersion>, EngineError> {
        Ok(self.versions.get(&id.0).map(|v| v.clone()))
    }

    async fn find_draft(&self, flow_id: &FlowId) -> Result<Option<FlowVersion>, EngineError> {
        Ok(self
            .versions
            .iter()
            .find(|v| &v.flow_id == flow_id && v.state == FlowVersionState::Draft)
            .map(|v| v.clone()))
    }

    async fn list_versions(&self, flow_id: &FlowId) -> Result<Vec<FlowVersion>, EngineError> {
        let mut versions: Vec<FlowVersion> = self
            .versions
            .iter()
            .filter(|v| &v.flow_id == flow_id)
            .map(|v| v.clone())
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }
}

/// In-memory implementation of the FlowRunRepository
///
/// Maintains a correlation-id index alongside the run records. The index
/// entry for a run exists only while the run holds pause metadata, so a
/// consumed correlation id stops resolving as soon as the resumed run is
/// saved.
pub struct InMemoryFlowRunRepository {
    runs: DashMap<String, FlowRun>,
    correlations: DashMap<String, String>,
}

impl InMemoryFlowRunRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
            correlations: DashMap::new(),
        }
    }
}

impl Default for InMemoryFlowRunRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowRunRepository for InMemoryFlowRunRepository {
    async fn save(&self, run: &FlowRun) -> Result<(), EngineError> {
        self.correlations.retain(|_, run_id| run_id != &run.id.0);
        if let Some(metadata) = &run.pause_metadata {
            self.correlations
                .insert(metadata.correlation_id.0.clone(), run.id.0.clone());
        }
        self.runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &RunId) -> Result<Option<FlowRun>, EngineError> {
        Ok(self.runs.get(&id.0).map(|r| r.clone()))
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<FlowRun>, EngineError> {
        let run_id = match self.correlations.get(&correlation_id.0) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        Ok(self.runs.get(&run_id).map(|r| r.clone()))
    }

    async fn list(
        &self,
        flow_id: Option<&FlowId>,
        status: Option<RunStatus>,
    ) -> Result<Vec<FlowRun>, EngineError> {
        let mut runs: Vec<FlowRun> = self
            .runs
            .iter()
            .filter(|run| {
                let flow_match = flow_id.map_or(true, |id| &run.flow_id == id);
                let status_match = status.map_or(true, |s| run.status == s);
                flow_match && status_match
            })
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn delete_for_flow(&self, flow_id: &FlowId) -> Result<(), EngineError> {
        let removed: Vec<String> = self
            .runs
            .iter()
            .filter(|run| &run.flow_id == flow_id)
            .map(|run| run.id.0.clone())
            .collect();
        for run_id in &removed {
            self.runs.remove(run_id);
            self.correlations.retain(|_, id| id != run_id);
        }
        debug!(flow_id = %flow_id.0, count = removed.len(), "deleted runs for flow");
        Ok(())
    }
}

/// In-memory implementation of the WorkerMachineRepository
pub struct InMemoryWorkerMachineRepository {
    machines: DashMap<String, WorkerMachine>,
}

impl InMemoryWorkerMachineRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self {
            machines: DashMap::new(),
        }
    }
}

impl Default for InMemoryWorkerMachineRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerMachineRepository for InMemoryWorkerMachineRepository {
    async fn upsert(&self, machine: &WorkerMachine) -> Result<(), EngineError> {
        self.machines
            .insert(machine.principal.0.clone(), machine.clone());
        Ok(())
    }

    async fn find(
        &self,
        principal: &WorkerPrincipal,
    ) -> Result<Option<WorkerMachine>, EngineError> {
        Ok(self.machines.get(&principal.0).map(|m| m.clone()))
    }

    async fn list_all(&self) -> Result<Vec<WorkerMachine>, EngineError> {
        Ok(self.machines.iter().map(|m| m.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::domain::flow::ProjectId;
    use flowforge_core::DataPacket;

    fn flow_and_draft() -> (Flow, FlowVersion) {
        let flow = Flow::new(ProjectId("p1".to_string()));
        let draft = FlowVersion::new_draft(flow.id.clone(), "My flow".to_string());
        (flow, draft)
    }

    #[tokio::test]
    async fn test_flow_roundtrip_and_cascade_delete() {
        let repo = InMemoryFlowRepository::new();
        let (flow, draft) = flow_and_draft();

        repo.save_flow(&flow).await.unwrap();
        repo.save_version(&draft).await.unwrap();
        assert!(repo.find_flow(&flow.id).await.unwrap().is_some());
        assert!(repo.find_draft(&flow.id).await.unwrap().is_some());

        repo.delete_flow(&flow.id).await.unwrap();
        assert!(repo.find_flow(&flow.id).await.unwrap().is_none());
        assert!(repo.find_version(&draft.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_versions_newest_first() {
        let repo = InMemoryFlowRepository::new();
        let (flow, first) = flow_and_draft();
        repo.save_version(&first).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = FlowVersion::new_draft(flow.id.clone(), "My flow".to_string());
        repo.save_version(&second).await.unwrap();

        let versions = repo.list_versions(&flow.id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].id, second.id);
    }

    #[tokio::test]
    async fn test_correlation_index_follows_pause_metadata() {
        let repo = InMemoryFlowRunRepository::new();
        let (flow, draft) = flow_and_draft();
        let cid = CorrelationId("cid-1".to_string());

        let mut run = FlowRun::new(
            flow.id.clone(),
            draft.id.clone(),
            flow.project_id.clone(),
            DataPacket::null(),
        );
        run.begin().unwrap();
        run.pause(cid.clone(), "waiting".to_string(), "step_1".to_string())
            .unwrap();
        repo.save(&run).await.unwrap();

        let found = repo.find_by_correlation(&cid).await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(run.id.clone()));

        // Consuming the metadata and saving removes the index entry
        run.resume().unwrap();
        repo.save(&run).await.unwrap();
        assert!(repo.find_by_correlation(&cid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_runs_filters() {
        let repo = InMemoryFlowRunRepository::new();
        let (flow, draft) = flow_and_draft();

        let queued = FlowRun::new(
            flow.id.clone(),
            draft.id.clone(),
            flow.project_id.clone(),
            DataPacket::null(),
        );
        let mut running = FlowRun::new(
            flow.id.clone(),
            draft.id.clone(),
            flow.project_id.clone(),
            DataPacket::null(),
        );
        running.begin().unwrap();
        repo.save(&queued).await.unwrap();
        repo.save(&running).await.unwrap();

        let all = repo.list(Some(&flow.id), None).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_running = repo
            .list(Some(&flow.id), Some(RunStatus::Running))
            .await
            .unwrap();
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, running.id);
    }

    #[tokio::test]
    async fn test_worker_upsert_overwrites() {
        let repo = InMemoryWorkerMachineRepository::new();
        let principal = WorkerPrincipal("w1".to_string());

        let mut machine = WorkerMachine {
            principal: principal.clone(),
            ip: "10.0.0.1".to_string(),
            cpu_usage_percentage: 10.0,
            ram_usage_percentage: 20.0,
            total_available_ram_in_bytes: 1024,
            last_heartbeat_at: chrono::Utc::now(),
        };
        repo.upsert(&machine).await.unwrap();

        machine.cpu_usage_percentage = 95.0;
        repo.upsert(&machine).await.unwrap();

        let stored = repo.find(&principal).await.unwrap().unwrap();
        assert_eq!(stored.cpu_usage_percentage, 95.0);
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }
}
