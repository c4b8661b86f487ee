//! In-process cluster of shard drivers.
//!
//! Every node hosts a replica of every shard. Replicas talk over one
//! [`LocalNetwork`], report to one shared listener channel and can be
//! isolated, crashed and restarted. A crashed replica keeps its log and its
//! term/vote store, so a restart resumes from what it persisted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use shoal_core::{LogIndex, NodeId, ShardId};
use shoal_raft::{
    FileTermStore, MemoryLog, MemoryTermStore, RaftError, RaftNode, Role, ShardStatus, StorageError,
    TermStore,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, NodeConfig, PeerConfig, TimingConfig};
use crate::driver::{DriverError, ShardDriver, ShardHandle};
use crate::listener::{ChannelListener, ListenerEvent};
use crate::transport::LocalNetwork;

/// Term/vote store of a hosted replica.
pub type BoxedTermStore = Box<dyn TermStore + Send>;

/// Raft node as hosted by the cluster.
pub type HostedNode = RaftNode<MemoryLog, BoxedTermStore>;

/// Cluster errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A node configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A driver failed or could not be reached.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// No such node in the cluster.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// No leader could be found for the shard.
    #[error("no leader for {0}")]
    NoLeader(ShardId),
}

impl From<RaftError> for ClusterError {
    fn from(err: RaftError) -> Self {
        Self::Driver(DriverError::Raft(err))
    }
}

struct Replica {
    handle: ShardHandle,
    task: JoinHandle<Result<HostedNode, DriverError>>,
}

/// A set of nodes in one process, each hosting every shard.
pub struct LocalCluster {
    network: LocalNetwork,
    configs: BTreeMap<NodeId, NodeConfig>,
    shards: Vec<ShardId>,
    running: BTreeMap<(NodeId, ShardId), Replica>,
    crashed: BTreeMap<(NodeId, ShardId), (MemoryLog, BoxedTermStore)>,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl LocalCluster {
    /// Starts `size` nodes hosting shards `1..=shard_count`.
    ///
    /// With a `data_dir`, each replica persists its term and vote in
    /// `<data_dir>/node-<n>/shard-<s>.term`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a term store
    /// cannot be opened.
    pub async fn start(
        size: u64,
        shard_count: u64,
        timing: TimingConfig,
        data_dir: Option<&Path>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ListenerEvent>), ClusterError> {
        let (events, rx) = mpsc::unbounded_channel();
        let mut configs = BTreeMap::new();
        for id in 1..=size {
            let node_id = NodeId::new(id);
            let peers = (1..=size)
                .filter(|&peer| peer != id)
                .map(|peer| PeerConfig::local(NodeId::new(peer)))
                .collect();
            let mut config = NodeConfig::new(node_id)
                .with_peers(peers)
                .with_timing(timing.clone());
            if let Some(dir) = data_dir {
                config = config.with_data_dir(dir.join(node_id.to_string()));
            }
            config.validate()?;
            configs.insert(node_id, config);
        }

        let mut cluster = Self {
            network: LocalNetwork::new(),
            configs,
            shards: (1..=shard_count).map(ShardId::new).collect(),
            running: BTreeMap::new(),
            crashed: BTreeMap::new(),
            events,
        };

        let nodes: Vec<NodeId> = cluster.configs.keys().copied().collect();
        for node in nodes {
            for shard in cluster.shards.clone() {
                let terms = cluster.open_terms(node, shard)?;
                cluster.spawn_replica(node, shard, MemoryLog::new(), terms).await?;
            }
        }
        info!(nodes = size, shards = shard_count, "Cluster started");
        Ok((cluster, rx))
    }

    /// The network connecting the nodes.
    #[must_use]
    pub const fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// All node ids.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        self.configs.keys().copied().collect()
    }

    /// All shard ids.
    #[must_use]
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Handle of a running replica.
    #[must_use]
    pub fn handle(&self, node: NodeId, shard: ShardId) -> Option<&ShardHandle> {
        self.running.get(&(node, shard)).map(|replica| &replica.handle)
    }

    /// Statuses of every running replica of `shard`.
    pub async fn statuses(&self, shard: ShardId) -> Vec<(NodeId, ShardStatus)> {
        let mut statuses = Vec::new();
        for (&(node, replica_shard), replica) in &self.running {
            if replica_shard != shard {
                continue;
            }
            if let Ok(status) = replica.handle.status().await {
                statuses.push((node, status));
            }
        }
        statuses
    }

    /// The reachable leader of `shard` with the highest term, if any.
    pub async fn leader(&self, shard: ShardId) -> Option<NodeId> {
        let mut best: Option<(NodeId, ShardStatus)> = None;
        for (node, status) in self.statuses(shard).await {
            if status.role != Role::Leader || self.network.is_isolated(node).await {
                continue;
            }
            if best.map_or(true, |(_, b)| status.current_term > b.current_term) {
                best = Some((node, status));
            }
        }
        best.map(|(node, _)| node)
    }

    /// Polls until `shard` has a reachable leader or `timeout` passes.
    pub async fn wait_for_leader(&self, shard: ShardId, timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader(shard).await {
                return Some(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Proposes `data` through the current leader of `shard`.
    ///
    /// # Errors
    /// Returns `NoLeader` if no leader is known, or the driver's error.
    pub async fn propose(&self, shard: ShardId, data: Bytes) -> Result<LogIndex, ClusterError> {
        let leader = self.leader(shard).await.ok_or(ClusterError::NoLeader(shard))?;
        let handle = self
            .handle(leader, shard)
            .ok_or(ClusterError::UnknownNode(leader))?;
        Ok(handle.propose(data).await?)
    }

    /// Stops every replica on `node`, keeping what they persisted.
    ///
    /// # Errors
    /// Returns `UnknownNode` for an unknown node, or the driver's error if a
    /// replica had already failed.
    pub async fn crash(&mut self, node: NodeId) -> Result<(), ClusterError> {
        if !self.configs.contains_key(&node) {
            return Err(ClusterError::UnknownNode(node));
        }
        for shard in self.shards.clone() {
            let Some(replica) = self.running.remove(&(node, shard)) else {
                continue;
            };
            self.network.unregister(node, shard).await;
            let raft = stop(replica, shard).await?;
            self.crashed.insert((node, shard), raft.into_parts());
        }
        warn!(node = %node, "Node crashed");
        Ok(())
    }

    /// Restarts every crashed replica on `node` from its persisted state.
    ///
    /// # Errors
    /// Returns `UnknownNode` for an unknown node, or an error if a replica
    /// cannot be recreated.
    pub async fn restart(&mut self, node: NodeId) -> Result<(), ClusterError> {
        if !self.configs.contains_key(&node) {
            return Err(ClusterError::UnknownNode(node));
        }
        for shard in self.shards.clone() {
            if let Some((log, terms)) = self.crashed.remove(&(node, shard)) {
                self.spawn_replica(node, shard, log, terms).await?;
            }
        }
        info!(node = %node, "Node restarted");
        Ok(())
    }

    /// Stops every replica.
    ///
    /// # Errors
    /// Returns the first driver error encountered. Every replica is stopped
    /// regardless.
    pub async fn shutdown(mut self) -> Result<(), ClusterError> {
        let mut first_error = None;
        for ((node, shard), replica) in std::mem::take(&mut self.running) {
            self.network.unregister(node, shard).await;
            if let Err(err) = stop(replica, shard).await {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        info!("Cluster stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn open_terms(&self, node: NodeId, shard: ShardId) -> Result<BoxedTermStore, ClusterError> {
        let config = self.configs.get(&node).ok_or(ClusterError::UnknownNode(node))?;
        match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| RaftError::from(StorageError::io("create data dir", &e)))?;
                let store = FileTermStore::open(term_path(dir, shard)).map_err(RaftError::from)?;
                Ok(Box::new(store))
            }
            None => Ok(Box::new(MemoryTermStore::new())),
        }
    }

    async fn spawn_replica(
        &mut self,
        node: NodeId,
        shard: ShardId,
        log: MemoryLog,
        terms: BoxedTermStore,
    ) -> Result<(), ClusterError> {
        let config = self.configs.get(&node).ok_or(ClusterError::UnknownNode(node))?;
        let seed = node.get().wrapping_mul(1_000_003).wrapping_add(shard.get());
        let raft = RaftNode::new(&config.raft_config(seed), log, terms)?;

        let (driver, handle) = ShardDriver::new(
            shard,
            raft,
            self.network.transport(node),
            ChannelListener::with_sender(node, self.events.clone()),
            config.queue_capacity,
            config.timing.request_timeout,
        );
        self.network.register(node, shard, handle.mailbox()).await;
        let task = tokio::spawn(driver.run());
        self.running.insert((node, shard), Replica { handle, task });
        Ok(())
    }
}

async fn stop(replica: Replica, shard: ShardId) -> Result<HostedNode, ClusterError> {
    replica.handle.shutdown().await;
    match replica.task.await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DriverError::Stopped(shard).into()),
    }
}

fn term_path(dir: &Path, shard: ShardId) -> PathBuf {
    dir.join(format!("{shard}.term"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELECTION_WAIT: Duration = Duration::from_secs(5);

    /// Collects each node's applied payload at `index`, in whatever order nodes apply.
    async fn applied_everywhere(
        events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
        nodes: &[NodeId],
        index: LogIndex,
    ) -> BTreeMap<NodeId, Bytes> {
        let mut seen = BTreeMap::new();
        while seen.len() < nodes.len() {
            let event = tokio::time::timeout(ELECTION_WAIT, events.recv())
                .await
                .expect("timed out waiting for apply")
                .expect("listener channel closed");
            if let ListenerEvent::Applied { node, entry, .. } = event {
                if entry.index == index && nodes.contains(&node) {
                    seen.insert(node, entry.data);
                }
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_three_node_election() {
        let (cluster, _events) =
            LocalCluster::start(3, 1, TimingConfig::fast_for_testing(), None)
                .await
                .unwrap();
        let shard = ShardId::new(1);

        let leader = cluster.wait_for_leader(shard, ELECTION_WAIT).await.unwrap();
        let statuses = cluster.statuses(shard).await;
        let leaders: Vec<_> = statuses
            .iter()
            .filter(|(_, s)| s.role == Role::Leader)
            .map(|(n, _)| *n)
            .collect();
        assert_eq!(leaders, vec![leader]);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_proposal_applied_on_every_node() {
        let (cluster, mut events) =
            LocalCluster::start(3, 1, TimingConfig::fast_for_testing(), None)
                .await
                .unwrap();
        let shard = ShardId::new(1);
        cluster.wait_for_leader(shard, ELECTION_WAIT).await.unwrap();

        let index = cluster.propose(shard, Bytes::from("x=1")).await.unwrap();
        let nodes = cluster.nodes();
        let seen = applied_everywhere(&mut events, &nodes, index).await;
        assert_eq!(seen.keys().copied().collect::<Vec<_>>(), nodes);
        assert!(seen.values().all(|data| *data == Bytes::from("x=1")));

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failover_after_leader_isolated() {
        let (cluster, _events) =
            LocalCluster::start(3, 1, TimingConfig::fast_for_testing(), None)
                .await
                .unwrap();
        let shard = ShardId::new(1);
        let old = cluster.wait_for_leader(shard, ELECTION_WAIT).await.unwrap();
        let old_term = cluster
            .handle(old, shard)
            .unwrap()
            .status()
            .await
            .unwrap()
            .current_term;

        cluster.network().isolate(old).await;
        let new = cluster.wait_for_leader(shard, ELECTION_WAIT).await.unwrap();
        assert_ne!(new, old);

        let status = cluster.handle(new, shard).unwrap().status().await.unwrap();
        assert!(status.current_term > old_term);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shards_elect_independently() {
        let (cluster, _events) =
            LocalCluster::start(3, 4, TimingConfig::fast_for_testing(), None)
                .await
                .unwrap();

        for &shard in cluster.shards() {
            assert!(cluster.wait_for_leader(shard, ELECTION_WAIT).await.is_some());
        }

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_keeps_term_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cluster, _events) =
            LocalCluster::start(3, 1, TimingConfig::fast_for_testing(), Some(dir.path()))
                .await
                .unwrap();
        let shard = ShardId::new(1);
        cluster.wait_for_leader(shard, ELECTION_WAIT).await.unwrap();

        // Node 1 may still have the election's messages queued.
        let node = NodeId::new(1);
        let before = loop {
            let status = cluster.handle(node, shard).unwrap().status().await.unwrap();
            if status.current_term.get() > 0 {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        cluster.crash(node).await.unwrap();
        assert!(cluster.handle(node, shard).is_none());
        assert!(dir.path().join("node-1").join("shard-1.term").exists());

        cluster.restart(node).await.unwrap();
        let after = cluster.handle(node, shard).unwrap().status().await.unwrap();
        assert!(after.current_term >= before.current_term);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let (mut cluster, _events) =
            LocalCluster::start(1, 1, TimingConfig::fast_for_testing(), None)
                .await
                .unwrap();

        assert!(matches!(
            cluster.crash(NodeId::new(9)).await,
            Err(ClusterError::UnknownNode(_))
        ));
        cluster.shutdown().await.unwrap();
    }
}
