//! Integration tests for the worker fleet registry over the in-memory store

use std::sync::Arc;
use std::time::Duration;

use flowforge_core::application::fleet::{LeastLoaded, RoundRobin, WorkerFleetRegistry};
use flowforge_core::WorkerMachineRepository;
use flowforge_state_inmemory::InMemoryWorkerMachineRepository;

fn registry(window: chrono::Duration) -> (Arc<InMemoryWorkerMachineRepository>, WorkerFleetRegistry) {
    let repo = Arc::new(InMemoryWorkerMachineRepository::new());
    let fleet = WorkerFleetRegistry::with_liveness_window(repo.clone(), window);
    (repo, fleet)
}

#[tokio::test]
async fn test_heartbeat_overwrites_previous_snapshot() {
    let (repo, fleet) = registry(chrono::Duration::seconds(60));
    let principal = fleet.register();

    fleet
        .upsert(principal.clone(), 10.0, 20.0, 1024, "10.0.0.1".to_string())
        .await
        .unwrap();
    fleet
        .upsert(principal.clone(), 90.0, 80.0, 2048, "10.0.0.2".to_string())
        .await
        .unwrap();

    let stored = repo.find(&principal).await.unwrap().unwrap();
    assert_eq!(stored.cpu_usage_percentage, 90.0);
    assert_eq!(stored.ip, "10.0.0.2");
    assert_eq!(repo.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_quiet_worker_drops_out_of_the_live_list_without_deletion() {
    let (repo, fleet) = registry(chrono::Duration::milliseconds(30));
    let principal = fleet.register();
    fleet
        .upsert(principal.clone(), 10.0, 20.0, 1024, "10.0.0.1".to_string())
        .await
        .unwrap();
    assert_eq!(fleet.list().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(fleet.list().await.unwrap().is_empty());

    // The snapshot itself is still stored
    assert!(repo.find(&principal).await.unwrap().is_some());

    // A fresh heartbeat brings the worker back
    fleet
        .upsert(principal, 10.0, 20.0, 1024, "10.0.0.1".to_string())
        .await
        .unwrap();
    assert_eq!(fleet.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_round_robin_cycles_through_live_workers() {
    let (_repo, fleet) = registry(chrono::Duration::seconds(60));
    for _ in 0..3 {
        let principal = fleet.register();
        fleet
            .upsert(principal, 10.0, 20.0, 1024, "10.0.0.1".to_string())
            .await
            .unwrap();
    }

    let strategy = RoundRobin::new();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let machine = fleet.select(&strategy).await.unwrap().unwrap();
        seen.push(machine.principal.0);
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 3, "each live worker was selected once per cycle");
}

#[tokio::test]
async fn test_least_loaded_picks_the_idlest_machine() {
    let (_repo, fleet) = registry(chrono::Duration::seconds(60));

    let busy = fleet.register();
    fleet
        .upsert(busy, 95.0, 80.0, 1024, "10.0.0.1".to_string())
        .await
        .unwrap();
    let idle = fleet.register();
    fleet
        .upsert(idle.clone(), 5.0, 10.0, 1024, "10.0.0.2".to_string())
        .await
        .unwrap();

    let selected = fleet.select(&LeastLoaded).await.unwrap().unwrap();
    assert_eq!(selected.principal, idle);
}

#[tokio::test]
async fn test_empty_fleet_selects_nothing() {
    let (_repo, fleet) = registry(chrono::Duration::seconds(60));
    assert!(fleet.select(&RoundRobin::new()).await.unwrap().is_none());
}
