use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow::{FlowId, ProjectId};

/// An open capture window for testing a trigger before publish
///
/// At most one live record exists per flow; creating a new one supersedes
/// the old. Purely ephemeral, never part of the durable run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSimulation {
    /// Unique identifier
    pub id: String,

    /// The flow under test
    pub flow_id: FlowId,

    /// Owning project
    pub project_id: ProjectId,

    /// When the capture window opened
    pub created_at: DateTime<Utc>,
}

impl WebhookSimulation {
    /// Open a new capture window for a flow
    pub fn new(flow_id: FlowId, project_id: ProjectId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_id,
            project_id,
            created_at: Utc::now(),
        }
    }
}
