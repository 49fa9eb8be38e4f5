//! Concurrency tests for capacity reservations

use std::sync::Arc;
use tessera_core_fleet::{
    ChannelHealthSource, FleetError, HealthReport, HealthStatus, NodeId, NodeRegistry,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_oversubscribe() {
    let registry = Arc::new(NodeRegistry::default());
    registry.apply_report(HealthReport::healthy("node-1", 5, 10));
    let node = NodeId::from("node-1");

    let mut handles = Vec::new();
    for i in 0..32 {
        let registry = registry.clone();
        let node = node.clone();
        handles.push(tokio::spawn(async move {
            registry
                .reserve(&node, &format!("shard-{i}"), 1)
                .map(|r| r.commit())
        }));
    }

    let mut granted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(FleetError::CapacityExceeded { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(granted, 5);
    assert_eq!(rejected, 27);
    let snap = registry.get(&node).unwrap();
    assert_eq!(snap.reserved, 5);
    assert_eq!(snap.available(), 0);
}

#[tokio::test]
async fn test_cancelled_placement_releases_capacity() {
    let registry = Arc::new(NodeRegistry::default());
    registry.apply_report(HealthReport::healthy("node-1", 1, 10));
    let node = NodeId::from("node-1");

    let task = {
        let registry = registry.clone();
        let node = node.clone();
        tokio::spawn(async move {
            let reservation = registry.reserve(&node, "shard-a", 1).unwrap();
            // Never committed: the task is aborted while parked here.
            std::future::pending::<()>().await;
            reservation.commit();
        })
    };

    tokio::task::yield_now().await;
    while registry.get(&node).unwrap().reserved == 0 {
        tokio::task::yield_now().await;
    }
    task.abort();
    let _ = task.await;

    assert_eq!(registry.get(&node).unwrap().available(), 1);
    assert!(!registry.holds(&node, "shard-a"));
}

#[tokio::test]
async fn test_refresh_from_channel_source() {
    let registry = NodeRegistry::default();
    let (tx, source) = ChannelHealthSource::new();

    tx.send(HealthReport::healthy("node-1", 4, 10)).unwrap();
    tx.send(HealthReport::healthy("node-2", 4, 10).with_health(HealthStatus::Degraded))
        .unwrap();

    let applied = registry.refresh(&source).await.unwrap();

    assert_eq!(applied, 2);
    assert_eq!(registry.len(), 2);
    let healthy: Vec<_> = registry.healthy().into_iter().map(|n| n.id).collect();
    assert_eq!(healthy, vec![NodeId::from("node-1")]);
}
