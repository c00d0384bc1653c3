//! Lease-based mutual exclusion for draft edits
//!
//! Two mutation requests for the same flow are totally ordered; requests for
//! different flows proceed in parallel. Leases expire after a bounded TTL
//! even if release is never called, so a crashed holder cannot wedge a flow.
//! The `LeaseCoordinator` seam exists so deployments can back this with a
//! shared store's advisory lock while unit tests use the in-process table.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::EngineError;

/// A held lease; the token fences releases from expired holders
#[derive(Debug, Clone)]
pub struct Lease {
    /// The key the lease covers
    pub key: String,

    /// Fencing token, unique per acquisition
    pub token: Uuid,

    /// When the lease lapses on its own
    pub expires_at: Instant,
}

/// Distributed mutual-exclusion primitive with lease expiry
#[async_trait]
pub trait LeaseCoordinator: Send + Sync {
    /// Acquire a lease on `key`, waiting up to `wait`
    ///
    /// Returns [`EngineError::LockTimeout`] when the wait elapses; that error
    /// is retryable and the edit is never silently dropped.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Lease, EngineError>;

    /// Release a lease; a no-op if it already expired and was taken over
    fn release(&self, lease: &Lease);
}

/// In-process lease table
///
/// Acquisition polls the table rather than queueing wakers; contention on a
/// single flow is human-scale, so the poll interval is invisible in practice.
pub struct LocalLeaseCoordinator {
    leases: DashMap<String, (Uuid, Instant)>,
    poll_interval: Duration,
}

impl LocalLeaseCoordinator {
    /// Create a coordinator with the default poll interval
    pub fn new() -> Self {
        Self {
            leases: DashMap::new(),
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl Default for LocalLeaseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseCoordinator for LocalLeaseCoordinator {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Lease, EngineError> {
        let deadline = Instant::now() + wait;

        loop {
            let token = Uuid::new_v4();
            let now = Instant::now();
            let mut acquired = false;

            match self.leases.entry(key.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    // Expired leases are taken over, not waited out
                    if occupied.get().1 <= now {
                        warn!(key, "taking over an expired lease");
                        occupied.insert((token, now + ttl));
                        acquired = true;
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert((token, now + ttl));
                    acquired = true;
                }
            }

            if acquired {
                debug!(key, %token, "lease acquired");
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                    expires_at: now + ttl,
                });
            }

            if Instant::now() >= deadline {
                return Err(EngineError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn release(&self, lease: &Lease) {
        self.leases
            .remove_if(&lease.key, |_, (token, _)| *token == lease.token);
        debug!(key = %lease.key, "lease released");
    }
}

/// Releases the lease when dropped, covering every exit path including
/// panics and task cancellation
struct LeaseGuard {
    coordinator: Arc<dyn LeaseCoordinator>,
    lease: Option<Lease>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.coordinator.release(&lease);
        }
    }
}

/// Run `f` while holding the lease on `key`
pub async fn with_lock<F, Fut, T>(
    coordinator: Arc<dyn LeaseCoordinator>,
    key: &str,
    ttl: Duration,
    wait: Duration,
    f: F,
) -> Result<T, EngineError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let lease = coordinator.acquire(key, ttl, wait).await?;
    let _guard = LeaseGuard {
        coordinator,
        lease: Some(lease),
    };
    f().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> Arc<dyn LeaseCoordinator> {
        Arc::new(LocalLeaseCoordinator::new())
    }

    #[tokio::test]
    async fn test_same_key_is_mutually_exclusive() {
        let coordinator = coordinator();
        let ttl = Duration::from_secs(5);

        let lease = coordinator.acquire("flow-1", ttl, Duration::from_secs(1)).await.unwrap();
        let second = coordinator
            .acquire("flow-1", ttl, Duration::from_millis(30))
            .await;
        assert!(matches!(second, Err(EngineError::LockTimeout(_))));

        coordinator.release(&lease);
        assert!(coordinator
            .acquire("flow-1", ttl, Duration::from_millis(30))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_different_keys_proceed_in_parallel() {
        let coordinator = coordinator();
        let ttl = Duration::from_secs(5);

        let a = coordinator.acquire("flow-a", ttl, Duration::from_millis(30)).await;
        let b = coordinator.acquire("flow-b", ttl, Duration::from_millis(30)).await;
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let coordinator = coordinator();

        let stale = coordinator
            .acquire("flow-1", Duration::from_millis(20), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // TTL elapsed without a release; the next acquirer takes over
        let fresh = coordinator
            .acquire("flow-1", Duration::from_secs(5), Duration::from_millis(100))
            .await
            .unwrap();

        // The stale holder's release no longer evicts the new lease
        coordinator.release(&stale);
        let blocked = coordinator
            .acquire("flow-1", Duration::from_secs(5), Duration::from_millis(30))
            .await;
        assert!(matches!(blocked, Err(EngineError::LockTimeout(_))));
        coordinator.release(&fresh);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let coordinator = coordinator();

        let result: Result<(), EngineError> = with_lock(
            coordinator.clone(),
            "flow-1",
            Duration::from_secs(5),
            Duration::from_millis(50),
            || async { Err(EngineError::Internal("boom".to_string())) },
        )
        .await;
        assert!(result.is_err());

        // The lease was released despite the failure
        assert!(coordinator
            .acquire("flow-1", Duration::from_secs(5), Duration::from_millis(30))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_with_lock_serializes_critical_sections() {
        let coordinator = coordinator();
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                with_lock(
                    coordinator,
                    "flow-1",
                    Duration::from_secs(5),
                    Duration::from_secs(5),
                    || async {
                        let current = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(current, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_section.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
