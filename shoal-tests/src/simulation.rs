//! Deterministic discrete-event simulation of a Raft cluster.
//!
//! Time is a logical microsecond clock. Every message delivery and timer
//! expiry is an event in one ordered queue, and every random choice (message
//! loss, duplication, latency, election timeouts) comes from seeded RNGs, so
//! a seed fully determines a run.
//!
//! Timers follow the single-shot semantics of the runtime: re-arming or
//! cancelling a timer bumps its generation, and an expiry whose generation is
//! stale is ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shoal_core::{LogIndex, NodeId, TermId};
use shoal_raft::{
    LogEntry, MemoryLog, MemoryTermStore, Message, RaftConfig, RaftError, RaftNode, RaftOutput,
};
use tracing::{debug, error, trace};

use crate::properties::PropertyChecker;
use crate::scenarios::faults::NetworkFaults;
use crate::scenarios::timing;

/// Raft node as simulated.
pub type SimRaft = RaftNode<MemoryLog, MemoryTermStore>;

/// Configuration of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of nodes, ids `1..=node_count`.
    pub node_count: u64,
    /// Seed for every random choice.
    pub seed: u64,
    /// Network behavior.
    pub faults: NetworkFaults,
}

impl SimulationConfig {
    /// A reliable network of `node_count` nodes.
    #[must_use]
    pub fn new(node_count: u64, seed: u64) -> Self {
        Self {
            node_count,
            seed,
            faults: NetworkFaults::RELIABLE,
        }
    }

    /// Sets the network fault profile.
    #[must_use]
    pub const fn with_faults(mut self, faults: NetworkFaults) -> Self {
        self.faults = faults;
        self
    }
}

/// Counters collected during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationStats {
    /// Events processed.
    pub events: u64,
    /// Messages handed to the network.
    pub messages_sent: u64,
    /// Messages lost to faults or partitions.
    pub messages_dropped: u64,
    /// Extra copies delivered.
    pub messages_duplicated: u64,
    /// Elections won.
    pub leaders_elected: u64,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Election,
    Heartbeat,
}

#[derive(Debug, Clone)]
enum EventKind {
    Deliver(Message),
    ElectionTimeout { node: NodeId, generation: u64 },
    Heartbeat { node: NodeId, generation: u64 },
}

/// One simulated cluster member.
#[derive(Debug)]
pub struct SimNode {
    id: NodeId,
    config: RaftConfig,
    raft: Option<SimRaft>,
    persisted: Option<(MemoryLog, MemoryTermStore)>,
    election_generation: u64,
    heartbeat_generation: u64,
    applied: Vec<LogEntry>,
}

impl SimNode {
    /// This node's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// True while the node is crashed.
    #[must_use]
    pub const fn is_crashed(&self) -> bool {
        self.raft.is_none()
    }

    /// The running state machine, if the node is up.
    #[must_use]
    pub const fn raft(&self) -> Option<&SimRaft> {
        self.raft.as_ref()
    }

    const fn generation(&self, timer: Timer) -> u64 {
        match timer {
            Timer::Election => self.election_generation,
            Timer::Heartbeat => self.heartbeat_generation,
        }
    }

    /// Every entry handed to this node's application, in order.
    #[must_use]
    pub fn applied(&self) -> &[LogEntry] {
        &self.applied
    }
}

/// A cluster, its network and its clock.
#[derive(Debug)]
pub struct Simulation {
    config: SimulationConfig,
    rng: StdRng,
    now_us: u64,
    next_seq: u64,
    queue: BTreeMap<(u64, u64), EventKind>,
    nodes: BTreeMap<NodeId, SimNode>,
    blocked: BTreeSet<(NodeId, NodeId)>,
    stats: SimulationStats,
}

impl Simulation {
    /// Creates the cluster and arms every node's first election timer.
    ///
    /// # Panics
    /// Panics if the cluster size is outside the supported range.
    #[must_use]
    pub fn new(config: SimulationConfig) -> Self {
        let ids: Vec<NodeId> = (1..=config.node_count).map(NodeId::new).collect();
        let mut sim = Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            now_us: 0,
            next_seq: 0,
            queue: BTreeMap::new(),
            nodes: BTreeMap::new(),
            blocked: BTreeSet::new(),
            stats: SimulationStats::default(),
        };

        for &id in &ids {
            let raft_config = RaftConfig::new(id, ids.iter().copied().filter(|&p| p != id))
                .with_election_timeout(timing::ELECTION_TIMEOUT_MIN, timing::ELECTION_TIMEOUT_MAX)
                .with_heartbeat_interval(timing::HEARTBEAT_INTERVAL)
                .with_random_seed(sim.config.seed ^ id.get().wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let raft = RaftNode::new(&raft_config, MemoryLog::new(), MemoryTermStore::new())
                .expect("simulated cluster configuration is valid");
            sim.nodes.insert(
                id,
                SimNode {
                    id,
                    config: raft_config,
                    raft: Some(raft),
                    persisted: None,
                    election_generation: 0,
                    heartbeat_generation: 0,
                    applied: Vec::new(),
                },
            );
        }

        for id in ids {
            sim.boot(id);
        }
        sim
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Current logical time.
    #[must_use]
    pub const fn now(&self) -> Duration {
        Duration::from_micros(self.now_us)
    }

    /// Run counters.
    #[must_use]
    pub const fn stats(&self) -> SimulationStats {
        self.stats
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.values()
    }

    /// One node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&SimNode> {
        self.nodes.get(&id)
    }

    /// The running leader with the highest term, if any.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter_map(|n| n.raft.as_ref().map(|r| (n.id, r)))
            .filter(|(_, r)| r.is_leader())
            .max_by_key(|(_, r)| r.current_term())
            .map(|(id, _)| id)
    }

    /// Every running leader with its term.
    #[must_use]
    pub fn leaders(&self) -> Vec<(NodeId, TermId)> {
        self.nodes
            .values()
            .filter_map(|n| n.raft.as_ref().map(|r| (n.id, r)))
            .filter(|(_, r)| r.is_leader())
            .map(|(id, r)| (id, r.current_term()))
            .collect()
    }

    /// Highest commit index among running nodes.
    #[must_use]
    pub fn max_commit_index(&self) -> LogIndex {
        self.nodes
            .values()
            .filter_map(|n| n.raft.as_ref())
            .map(RaftNode::commit_index)
            .max()
            .unwrap_or(LogIndex::new(0))
    }

    // ------------------------------------------------------------------------
    // Driving the clock
    // ------------------------------------------------------------------------

    /// Processes the next event. Returns false when nothing is scheduled.
    pub fn step(&mut self) -> bool {
        let Some(((at, _), event)) = self.queue.pop_first() else {
            return false;
        };
        self.now_us = at;
        self.stats.events += 1;

        match event {
            EventKind::Deliver(message) => {
                let to = message.to();
                if self.nodes.get(&to).is_some_and(SimNode::is_crashed) {
                    trace!(to = %to, kind = message.kind(), "Dropping message to crashed node");
                    self.stats.messages_dropped += 1;
                    return true;
                }
                self.drive(to, |raft| raft.handle_message(message));
            }
            EventKind::ElectionTimeout { node, generation } => {
                if self.timer_live(node, Timer::Election, generation) {
                    self.drive(node, SimRaft::handle_election_timeout);
                }
            }
            EventKind::Heartbeat { node, generation } => {
                if self.timer_live(node, Timer::Heartbeat, generation) {
                    self.drive(node, SimRaft::handle_heartbeat_timeout);
                }
            }
        }
        true
    }

    /// Advances the clock by `duration`, recording state after every event.
    pub fn run_for(&mut self, duration: Duration, checker: &mut PropertyChecker) {
        let deadline = self.now_us + micros(duration);
        while self
            .queue
            .first_key_value()
            .is_some_and(|(&(at, _), _)| at <= deadline)
        {
            self.step();
            checker.record(self);
        }
        self.now_us = deadline;
    }

    /// Runs until a leader exists or `limit` passes. Returns the leader.
    pub fn run_until_leader(
        &mut self,
        limit: Duration,
        checker: &mut PropertyChecker,
    ) -> Option<NodeId> {
        let deadline = self.now_us + micros(limit);
        while self.now_us < deadline {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            self.run_for(Duration::from_millis(10), checker);
        }
        self.leader()
    }

    // ------------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------------

    /// Proposes `data` through the current leader.
    pub fn propose(&mut self, data: Bytes) -> Option<LogIndex> {
        let leader = self.leader()?;
        self.propose_on(leader, data).ok()
    }

    /// Proposes `data` on one specific node.
    ///
    /// # Errors
    /// Returns the node's refusal, usually `NotLeader`.
    ///
    /// # Panics
    /// Panics if `node` is unknown or crashed.
    pub fn propose_on(&mut self, node: NodeId, data: Bytes) -> Result<LogIndex, RaftError> {
        let raft = self
            .nodes
            .get_mut(&node)
            .and_then(|n| n.raft.as_mut())
            .expect("proposing on a running node");
        let (index, outputs) = raft.propose(data)?;
        self.execute(node, outputs);
        Ok(index)
    }

    // ------------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------------

    /// Stops `node`. Its log and term store survive; role state is lost.
    pub fn crash(&mut self, node: NodeId) {
        let Some(sim_node) = self.nodes.get_mut(&node) else {
            return;
        };
        let Some(raft) = sim_node.raft.take() else {
            return;
        };
        sim_node.persisted = Some(raft.into_parts());
        sim_node.election_generation += 1;
        sim_node.heartbeat_generation += 1;
        debug!(node = %node, at_us = self.now_us, "Crashed node");
    }

    /// Restarts a crashed `node` from what it persisted.
    pub fn restart(&mut self, node: NodeId) {
        let Some(sim_node) = self.nodes.get_mut(&node) else {
            return;
        };
        let Some((log, terms)) = sim_node.persisted.take() else {
            return;
        };
        let raft = RaftNode::new(&sim_node.config, log, terms)
            .expect("configuration was valid at first boot");
        sim_node.raft = Some(raft);
        debug!(node = %node, at_us = self.now_us, "Restarted node");
        self.boot(node);
    }

    /// Blocks traffic between the two groups, in both directions.
    pub fn partition(&mut self, side_a: &[NodeId], side_b: &[NodeId]) {
        for &a in side_a {
            for &b in side_b {
                self.blocked.insert((a, b));
                self.blocked.insert((b, a));
            }
        }
        debug!(?side_a, ?side_b, "Partitioned network");
    }

    /// Cuts `node` off from everyone else.
    pub fn isolate(&mut self, node: NodeId) {
        let others: Vec<NodeId> = self.nodes.keys().copied().filter(|&n| n != node).collect();
        self.partition(&[node], &others);
    }

    /// Removes every partition.
    pub fn heal(&mut self) {
        self.blocked.clear();
        debug!("Healed network");
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn boot(&mut self, node: NodeId) {
        let outputs = match self.nodes.get_mut(&node).and_then(|n| n.raft.as_mut()) {
            Some(raft) => raft.start(),
            None => return,
        };
        self.execute(node, outputs);
    }

    fn timer_live(&self, node: NodeId, timer: Timer, generation: u64) -> bool {
        self.nodes
            .get(&node)
            .is_some_and(|n| !n.is_crashed() && n.generation(timer) == generation)
    }

    fn drive(
        &mut self,
        node: NodeId,
        handler: impl FnOnce(&mut SimRaft) -> Result<Vec<RaftOutput>, RaftError>,
    ) {
        let Some(raft) = self.nodes.get_mut(&node).and_then(|n| n.raft.as_mut()) else {
            return;
        };
        match handler(raft) {
            Ok(outputs) => self.execute(node, outputs),
            Err(err) => {
                error!(node = %node, error = %err, "Handler failed; crashing node");
                self.crash(node);
            }
        }
    }

    fn execute(&mut self, node: NodeId, outputs: Vec<RaftOutput>) {
        for output in outputs {
            match output {
                RaftOutput::Send(message) => self.send(message),
                RaftOutput::ResetElectionTimer { timeout } => {
                    let generation = self.bump(node, Timer::Election);
                    self.schedule(timeout, EventKind::ElectionTimeout { node, generation });
                }
                RaftOutput::CancelElectionTimer => {
                    self.bump(node, Timer::Election);
                }
                RaftOutput::ResetHeartbeatTimer { interval } => {
                    let generation = self.bump(node, Timer::Heartbeat);
                    self.schedule(interval, EventKind::Heartbeat { node, generation });
                }
                RaftOutput::CancelHeartbeatTimer => {
                    self.bump(node, Timer::Heartbeat);
                }
                RaftOutput::Apply(entry) => {
                    if let Some(sim_node) = self.nodes.get_mut(&node) {
                        sim_node.applied.push(entry);
                    }
                }
                RaftOutput::BecameLeader { term } => {
                    self.stats.leaders_elected += 1;
                    debug!(node = %node, term = term.get(), at_us = self.now_us, "Leader elected");
                }
                RaftOutput::BecameFollower { .. }
                | RaftOutput::CommitIndexAdvanced { .. }
                | RaftOutput::SnapshotRequired { .. } => {}
            }
        }
    }

    fn send(&mut self, message: Message) {
        self.stats.messages_sent += 1;
        let (from, to) = (message.from(), message.to());
        if self.blocked.contains(&(from, to)) {
            self.stats.messages_dropped += 1;
            return;
        }

        let faults = self.config.faults;
        if faults.drop_rate > 0.0 && self.rng.gen_bool(faults.drop_rate) {
            self.stats.messages_dropped += 1;
            return;
        }
        if faults.duplicate_rate > 0.0 && self.rng.gen_bool(faults.duplicate_rate) {
            self.stats.messages_duplicated += 1;
            let latency = self.latency();
            self.schedule(latency, EventKind::Deliver(message.clone()));
        }
        let latency = self.latency();
        self.schedule(latency, EventKind::Deliver(message));
    }

    fn latency(&mut self) -> Duration {
        let faults = self.config.faults;
        let min = micros(faults.min_latency);
        let max = micros(faults.max_latency).max(min);
        Duration::from_micros(self.rng.gen_range(min..=max))
    }

    fn bump(&mut self, node: NodeId, timer: Timer) -> u64 {
        self.nodes.get_mut(&node).map_or(0, |n| {
            let slot = match timer {
                Timer::Election => &mut n.election_generation,
                Timer::Heartbeat => &mut n.heartbeat_generation,
            };
            *slot += 1;
            *slot
        })
    }

    fn schedule(&mut self, after: Duration, event: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((self.now_us + micros(after), seq), event);
    }
}

fn micros(duration: Duration) -> u64 {
    // Safe cast: simulated spans are far below u64::MAX microseconds.
    #[allow(clippy::cast_possible_truncation)]
    let us = duration.as_micros() as u64;
    us
}
