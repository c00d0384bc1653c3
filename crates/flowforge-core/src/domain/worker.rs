use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Value object: the principal credential identifying a worker process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerPrincipal(pub String);

/// A registered executor process
///
/// The resource snapshot is overwritten, never merged, on every heartbeat.
/// Liveness is derived from `last_heartbeat_at` at read time; nothing is
/// deleted when a worker goes quiet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMachine {
    /// Identifying credential
    pub principal: WorkerPrincipal,

    /// Address the worker reported from
    pub ip: String,

    /// CPU usage, 0..=100
    pub cpu_usage_percentage: f32,

    /// RAM usage, 0..=100
    pub ram_usage_percentage: f32,

    /// Free memory in bytes
    pub total_available_ram_in_bytes: u64,

    /// When the last heartbeat arrived
    pub last_heartbeat_at: DateTime<Utc>,
}

impl WorkerMachine {
    /// Whether the last heartbeat is within the liveness window
    pub fn is_live(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_heartbeat_at <= window
    }
}
