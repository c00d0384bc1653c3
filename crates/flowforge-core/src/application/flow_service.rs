//! Flow mutation and version lifecycle service
//!
//! Every mutation of a flow's draft runs under that flow's edit lease, so
//! concurrent operations on one flow are totally ordered while different
//! flows proceed in parallel. The applier itself stays pure; this service
//! owns the load-apply-save sequencing around it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::lock::{with_lock, LeaseCoordinator};
use crate::domain::flow::{Flow, FlowId, FlowVersion, FlowVersionId, FlowVersionState, ProjectId};
use crate::domain::operations::{self, FlowOperation};
use crate::domain::repository::{FlowRepository, FlowRunRepository};
use crate::EngineError;

/// Tunables for the edit lease
#[derive(Debug, Clone)]
pub struct FlowServiceConfig {
    /// Lease TTL; an editor that crashes mid-apply frees the flow after this
    pub lock_ttl: Duration,

    /// How long a mutation waits for the lease before giving up
    pub lock_wait: Duration,
}

impl Default for FlowServiceConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(10),
        }
    }
}

/// Applies mutation operations and drives the version lifecycle
pub struct FlowMutationService {
    flows: Arc<dyn FlowRepository>,
    runs: Arc<dyn FlowRunRepository>,
    locks: Arc<dyn LeaseCoordinator>,
    config: FlowServiceConfig,
}

impl FlowMutationService {
    /// Create a service over the given repositories and lease coordinator
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        runs: Arc<dyn FlowRunRepository>,
        locks: Arc<dyn LeaseCoordinator>,
        config: FlowServiceConfig,
    ) -> Self {
        Self {
            flows,
            runs,
            locks,
            config,
        }
    }

    /// Create a flow with an empty draft version
    pub async fn create_flow(
        &self,
        project_id: ProjectId,
        display_name: String,
    ) -> Result<(Flow, FlowVersion), EngineError> {
        let flow = Flow::new(project_id);
        let draft = FlowVersion::new_draft(flow.id.clone(), display_name);

        self.flows.save_flow(&flow).await?;
        self.flows.save_version(&draft).await?;
        info!(flow_id = %flow.id.0, "created flow");
        Ok((flow, draft))
    }

    /// Apply one mutation operation to the flow's draft head
    ///
    /// Serialized per flow through the edit lease. Returns the new draft
    /// snapshot; the previous snapshot stays untouched in the store under
    /// its own id until superseded.
    pub async fn update(
        &self,
        flow_id: &FlowId,
        operation: &FlowOperation,
    ) -> Result<FlowVersion, EngineError> {
        let flows = self.flows.clone();
        let flow_id = flow_id.clone();
        let key = flow_id.0.clone();

        with_lock(
            self.locks.clone(),
            &key,
            self.config.lock_ttl,
            self.config.lock_wait,
            || async move {
                let draft = flows
                    .find_draft(&flow_id)
                    .await?
                    .ok_or_else(|| EngineError::VersionNotFound(flow_id.0.clone()))?;

                if draft.state != FlowVersionState::Draft {
                    return Err(EngineError::Validation(vec![format!(
                        "version {} is not a draft",
                        draft.id.0
                    )]));
                }

                let updated = operations::apply(&draft, operation)?;
                flows.save_version(&updated).await?;
                debug!(flow_id = %flow_id.0, version_id = %updated.id.0, "applied operation");
                Ok(updated)
            },
        )
        .await
    }

    /// Publish the draft head, locking the previously published version
    pub async fn publish(&self, flow_id: &FlowId) -> Result<FlowVersion, EngineError> {
        let flows = self.flows.clone();
        let flow_id = flow_id.clone();
        let key = flow_id.0.clone();

        with_lock(
            self.locks.clone(),
            &key,
            self.config.lock_ttl,
            self.config.lock_wait,
            || async move {
                let mut flow = flows
                    .find_flow(&flow_id)
                    .await?
                    .ok_or_else(|| EngineError::FlowNotFound(flow_id.0.clone()))?;
                let mut draft = flows
                    .find_draft(&flow_id)
                    .await?
                    .ok_or_else(|| EngineError::VersionNotFound(flow_id.0.clone()))?;

                if !draft.valid {
                    return Err(EngineError::Validation(vec![
                        "cannot publish a version that has never passed validation".to_string(),
                    ]));
                }

                if let Some(previous_id) = flow.published_version_id.take() {
                    if let Some(mut previous) = flows.find_version(&previous_id).await? {
                        previous.state = FlowVersionState::Locked;
                        previous.touch();
                        flows.save_version(&previous).await?;
                    }
                }

                draft.state = FlowVersionState::Published;
                draft.touch();
                flows.save_version(&draft).await?;

                flow.published_version_id = Some(draft.id.clone());
                flow.updated_at = draft.updated_at;
                flows.save_flow(&flow).await?;

                info!(flow_id = %flow_id.0, version_id = %draft.id.0, "published flow version");
                Ok(draft)
            },
        )
        .await
    }

    /// Open a new draft by copying the published version's content
    ///
    /// A no-op returning the existing draft when one is already open.
    pub async fn open_draft(&self, flow_id: &FlowId) -> Result<FlowVersion, EngineError> {
        let flows = self.flows.clone();
        let flow_id = flow_id.clone();
        let key = flow_id.0.clone();

        with_lock(
            self.locks.clone(),
            &key,
            self.config.lock_ttl,
            self.config.lock_wait,
            || async move {
                if let Some(draft) = flows.find_draft(&flow_id).await? {
                    return Ok(draft);
                }

                let flow = flows
                    .find_flow(&flow_id)
                    .await?
                    .ok_or_else(|| EngineError::FlowNotFound(flow_id.0.clone()))?;
                let published_id = flow
                    .published_version_id
                    .ok_or_else(|| EngineError::VersionNotFound(flow_id.0.clone()))?;
                let published = flows
                    .find_version(&published_id)
                    .await?
                    .ok_or_else(|| EngineError::VersionNotFound(published_id.0.clone()))?;

                let draft = published.reopen_as_draft();
                flows.save_version(&draft).await?;
                debug!(flow_id = %flow_id.0, version_id = %draft.id.0, "opened draft");
                Ok(draft)
            },
        )
        .await
    }

    /// Delete a flow, cascading to all of its versions and runs
    pub async fn delete_flow(&self, flow_id: &FlowId) -> Result<(), EngineError> {
        let flows = self.flows.clone();
        let runs = self.runs.clone();
        let flow_id = flow_id.clone();
        let key = flow_id.0.clone();

        with_lock(
            self.locks.clone(),
            &key,
            self.config.lock_ttl,
            self.config.lock_wait,
            || async move {
                if flows.find_flow(&flow_id).await?.is_none() {
                    return Err(EngineError::FlowNotFound(flow_id.0.clone()));
                }
                runs.delete_for_flow(&flow_id).await?;
                flows.delete_flow(&flow_id).await?;
                info!(flow_id = %flow_id.0, "deleted flow");
                Ok(())
            },
        )
        .await
    }

    /// Fetch one version snapshot by id
    pub async fn get_version(&self, id: &FlowVersionId) -> Result<FlowVersion, EngineError> {
        self.flows
            .find_version(id)
            .await?
            .ok_or_else(|| EngineError::VersionNotFound(id.0.clone()))
    }

    /// List all versions of a flow, newest first
    pub async fn list_versions(&self, flow_id: &FlowId) -> Result<Vec<FlowVersion>, EngineError> {
        self.flows.list_versions(flow_id).await
    }
}
