//! Worker fleet registry and dispatch strategies
//!
//! Snapshots are last-write-wins per principal. Liveness is re-derived from
//! the heartbeat timestamp on every read (lazy eviction); nothing is deleted
//! from the underlying store when a worker goes quiet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::domain::repository::WorkerMachineRepository;
use crate::domain::worker::{WorkerMachine, WorkerPrincipal};
use crate::EngineError;

/// Default liveness window for worker heartbeats
pub const DEFAULT_LIVENESS_WINDOW_SECS: i64 = 60;

/// Tracks live executor processes and exposes capacity for dispatch
pub struct WorkerFleetRegistry {
    repo: Arc<dyn WorkerMachineRepository>,
    liveness_window: Duration,
}

impl WorkerFleetRegistry {
    /// Create a registry with the default liveness window
    pub fn new(repo: Arc<dyn WorkerMachineRepository>) -> Self {
        Self::with_liveness_window(repo, Duration::seconds(DEFAULT_LIVENESS_WINDOW_SECS))
    }

    /// Create a registry with an explicit liveness window
    pub fn with_liveness_window(
        repo: Arc<dyn WorkerMachineRepository>,
        liveness_window: Duration,
    ) -> Self {
        Self {
            repo,
            liveness_window,
        }
    }

    /// Issue a fresh worker principal credential
    pub fn register(&self) -> WorkerPrincipal {
        let principal = WorkerPrincipal(Uuid::new_v4().to_string());
        debug!(principal = %principal.0, "registered worker principal");
        principal
    }

    /// Record a heartbeat, overwriting the previous snapshot
    pub async fn upsert(
        &self,
        principal: WorkerPrincipal,
        cpu_usage_percentage: f32,
        ram_usage_percentage: f32,
        total_available_ram_in_bytes: u64,
        ip: String,
    ) -> Result<WorkerMachine, EngineError> {
        let machine = WorkerMachine {
            principal,
            ip,
            cpu_usage_percentage,
            ram_usage_percentage,
            total_available_ram_in_bytes,
            last_heartbeat_at: Utc::now(),
        };
        self.repo.upsert(&machine).await?;
        Ok(machine)
    }

    /// All machines whose heartbeat is within the liveness window
    ///
    /// Sorted by principal so strategies see a stable order.
    pub async fn list(&self) -> Result<Vec<WorkerMachine>, EngineError> {
        let now = Utc::now();
        let mut live: Vec<WorkerMachine> = self
            .repo
            .list_all()
            .await?
            .into_iter()
            .filter(|m| m.is_live(now, self.liveness_window))
            .collect();
        live.sort_by(|a, b| a.principal.0.cmp(&b.principal.0));
        Ok(live)
    }

    /// Pick a live machine using the given strategy
    pub async fn select(
        &self,
        strategy: &dyn DispatchStrategy,
    ) -> Result<Option<WorkerMachine>, EngineError> {
        let live = self.list().await?;
        Ok(strategy.select(&live).cloned())
    }
}

/// Pluggable policy for choosing a worker from the live fleet
pub trait DispatchStrategy: Send + Sync {
    /// Choose one machine, or `None` when the fleet is empty
    fn select<'a>(&self, machines: &'a [WorkerMachine]) -> Option<&'a WorkerMachine>;
}

/// Rotates through the live fleet
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Create a round-robin strategy starting at the first machine
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchStrategy for RoundRobin {
    fn select<'a>(&self, machines: &'a [WorkerMachine]) -> Option<&'a WorkerMachine> {
        if machines.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % machines.len();
        machines.get(index)
    }
}

/// Prefers the machine with the lowest CPU usage, RAM as tie-breaker
pub struct LeastLoaded;

impl DispatchStrategy for LeastLoaded {
    fn select<'a>(&self, machines: &'a [WorkerMachine]) -> Option<&'a WorkerMachine> {
        machines.iter().min_by(|a, b| {
            (a.cpu_usage_percentage, a.ram_usage_percentage)
                .partial_cmp(&(b.cpu_usage_percentage, b.ram_usage_percentage))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(principal: &str, cpu: f32, ram: f32) -> WorkerMachine {
        WorkerMachine {
            principal: WorkerPrincipal(principal.to_string()),
            ip: "10.0.0.1".to_string(),
            cpu_usage_percentage: cpu,
            ram_usage_percentage: ram,
            total_available_ram_in_bytes: 1024,
            last_heartbeat_at: Utc::now(),
        }
    }

    #[test]
    fn test_round_robin_rotates() {
        let machines = vec![machine("a", 0.0, 0.0), machine("b", 0.0, 0.0)];
        let strategy = RoundRobin::new();

        assert_eq!(strategy.select(&machines).unwrap().principal.0, "a");
        assert_eq!(strategy.select(&machines).unwrap().principal.0, "b");
        assert_eq!(strategy.select(&machines).unwrap().principal.0, "a");
    }

    #[test]
    fn test_round_robin_empty_fleet() {
        let strategy = RoundRobin::new();
        assert!(strategy.select(&[]).is_none());
    }

    #[test]
    fn test_least_loaded_prefers_idle_cpu() {
        let machines = vec![
            machine("a", 80.0, 10.0),
            machine("b", 15.0, 90.0),
            machine("c", 15.0, 20.0),
        ];
        let strategy = LeastLoaded;
        assert_eq!(strategy.select(&machines).unwrap().principal.0, "c");
    }
}
