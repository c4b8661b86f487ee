//! Shard drivers on tokio, end to end.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use shoal_core::{LogIndex, NodeId, ShardId};
use shoal_runtime::{ListenerEvent, LocalCluster, TimingConfig};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Waits until every node in `nodes` has applied `index` of `shard`.
async fn wait_applied(
    events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
    shard: ShardId,
    index: LogIndex,
    nodes: &[NodeId],
) -> Vec<(NodeId, Bytes)> {
    let mut pending: BTreeSet<NodeId> = nodes.iter().copied().collect();
    let mut seen = Vec::new();
    while !pending.is_empty() {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for apply")
            .expect("listener closed");
        if let ListenerEvent::Applied {
            node,
            shard: s,
            entry,
        } = event
        {
            if s == shard && entry.index == index && pending.remove(&node) {
                seen.push((node, entry.data));
            }
        }
    }
    seen
}

#[tokio::test]
async fn test_runtime_failover_keeps_committed_and_accepts_new_writes() {
    let (cluster, mut events) =
        LocalCluster::start(3, 1, TimingConfig::fast_for_testing(), None)
            .await
            .unwrap();
    let shard = ShardId::new(1);
    let nodes = cluster.nodes();

    let old = cluster.wait_for_leader(shard, WAIT).await.unwrap();
    let first = cluster.propose(shard, Bytes::from("before")).await.unwrap();
    wait_applied(&mut events, shard, first, &nodes).await;

    cluster.network().isolate(old).await;
    let new = cluster.wait_for_leader(shard, WAIT).await.unwrap();
    assert_ne!(new, old);

    let second = cluster.propose(shard, Bytes::from("after")).await.unwrap();
    assert!(second > first);
    let majority: Vec<NodeId> = nodes.iter().copied().filter(|&n| n != old).collect();
    wait_applied(&mut events, shard, second, &majority).await;

    // Once reconnected, the old leader steps down and catches up.
    cluster.network().heal(old).await;
    let applied = wait_applied(&mut events, shard, second, &[old]).await;
    assert_eq!(applied, vec![(old, Bytes::from("after"))]);

    let status = cluster.handle(old, shard).unwrap().status().await.unwrap();
    assert_ne!(status.role, shoal_raft::Role::Leader);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_many_shards_all_commit() {
    let (cluster, mut events) =
        LocalCluster::start(3, 6, TimingConfig::fast_for_testing(), None)
            .await
            .unwrap();
    let nodes = cluster.nodes();

    for &shard in cluster.shards() {
        cluster.wait_for_leader(shard, WAIT).await.unwrap();
        let index = cluster
            .propose(shard, Bytes::from(format!("hello {shard}")))
            .await
            .unwrap();
        let applied = wait_applied(&mut events, shard, index, &nodes).await;
        assert!(applied
            .iter()
            .all(|(_, data)| *data == Bytes::from(format!("hello {shard}"))));
    }

    cluster.shutdown().await.unwrap();
}
