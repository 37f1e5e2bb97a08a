//! Grow-only counter: convergence, durability, partitions and restarts.
//!
//! Run with: cargo test --test counter_tests -- --nocapture

mod common;

use common::{wait_until, Cluster, CONVERGE};
use gossip_replica::{ReplicaConfig, Workload};

async fn all_read(cluster: &Cluster, expected: i64) -> bool {
    for index in 0..cluster.nodes.len() {
        if cluster.read_value(index).await != expected {
            return false;
        }
    }
    true
}

async fn stored(cluster: &Cluster, key: &str, expected: i64) -> bool {
    cluster.seq_kv.snapshot().await.get(key) == Some(&expected)
}

// =============================================================================
// Convergence
// =============================================================================

#[tokio::test]
async fn adds_converge_to_network_sum() {
    let cluster = Cluster::with_workload(3, Workload::Counter).await;

    let mut total = 0;
    for (index, delta) in [(0, 1), (1, 2), (2, 3), (0, 4), (1, 0), (2, 10)] {
        cluster.add(index, delta).await;
        total += delta;
    }

    assert!(
        wait_until(CONVERGE, || all_read(&cluster, total)).await,
        "counter did not converge to {}",
        total
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn read_sees_own_add_immediately() {
    let cluster = Cluster::with_workload(3, Workload::Counter).await;
    cluster.add(1, 9).await;
    assert_eq!(cluster.read_value(1).await, 9);
    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_adds_on_every_node() {
    let cluster = Cluster::with_workload(5, Workload::Counter).await;

    let mut tasks = Vec::new();
    for node in cluster.nodes.iter().cloned() {
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                node.handle_request("c1", gossip_replica::Payload::Add { delta: 1 })
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(wait_until(CONVERGE, || all_read(&cluster, 50)).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn signed_deltas_converge() {
    let cluster = Cluster::with_workload(3, Workload::Counter).await;
    for (index, delta) in [(0, 10), (1, -3), (2, 5), (0, -4)] {
        cluster.add(index, delta).await;
    }

    assert!(wait_until(CONVERGE, || all_read(&cluster, 8)).await);
    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n1", 10)).await);
    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n1_dec", 4)).await);
    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n2_dec", 3)).await);
    assert_eq!(cluster.seq_kv.snapshot().await.get("counter_n3_dec"), None);
    cluster.shutdown().await;
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn each_node_persists_its_own_total() {
    let cluster = Cluster::with_workload(3, Workload::Counter).await;
    cluster.add(0, 5).await;
    cluster.add(0, 2).await;
    cluster.add(2, 4).await;

    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n1", 7)).await);
    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n3", 4)).await);
    assert_eq!(cluster.seq_kv.snapshot().await.get("counter_n2"), None);
    cluster.shutdown().await;
}

#[tokio::test]
async fn partitioned_node_catches_up_through_store() {
    let cluster = Cluster::with_workload(3, Workload::Counter).await;
    cluster.network.isolate("n1");

    cluster.add(0, 3).await;
    cluster.add(1, 4).await;

    // Gossip cannot cross, but every node's total lands in the store and
    // each read resyncs from it.
    assert!(wait_until(CONVERGE, || all_read(&cluster, 7)).await);

    cluster.network.heal();
    assert!(wait_until(CONVERGE, || all_read(&cluster, 7)).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn gossip_and_store_never_double_count() {
    let cluster = Cluster::with_workload(2, Workload::Counter).await;
    cluster.add(0, 6).await;

    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n1", 6)).await);
    assert!(wait_until(CONVERGE, || all_read(&cluster, 6)).await);

    // Repeated resyncs after both paths have delivered keep the value put.
    for _ in 0..5 {
        assert_eq!(cluster.read_value(1).await, 6);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn restarted_node_continues_from_durable_total() {
    let mut cluster = Cluster::with_workload(3, Workload::Counter).await;
    cluster.add(0, 5).await;
    cluster.add(1, 1).await;
    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n1", 5)).await);

    cluster
        .restart(0, ReplicaConfig::for_testing(Workload::Counter))
        .await;
    assert!(wait_until(CONVERGE, || all_read(&cluster, 6)).await);

    cluster.add(0, 2).await;
    assert!(wait_until(CONVERGE, || stored(&cluster, "counter_n1", 7)).await);
    assert!(wait_until(CONVERGE, || all_read(&cluster, 8)).await);
    cluster.shutdown().await;
}
