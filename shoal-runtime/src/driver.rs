//! Shard driver: runs one [`RaftNode`] on a tokio task.
//!
//! The driver is a single-task reactor. It waits on inbound peer messages,
//! commands from [`ShardHandle`]s and two single-shot timers, feeds each into
//! the state machine and carries out the returned outputs:
//!
//! ```text
//! inbound ─┐
//! commands ─┼─► RaftNode::handle ─► timers ─► listener/delegate ─► transport
//! timers ──┘
//! ```
//!
//! Only one event is processed at a time, so the node needs no locking. A
//! persistence failure stops the driver: the node must not keep participating
//! on top of state it could not make durable.

use std::time::Duration;

use bytes::Bytes;
use shoal_core::{LogIndex, NodeId, ShardId};
use shoal_raft::{
    LogStore, Message, RaftError, RaftNode, RaftOutput, ShardMessage, ShardStatus, TermStore,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::delegate::LeaderLocalDelegate;
use crate::listener::RaftListener;
use crate::transport::Transport;

/// Driver errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The state machine refused or failed.
    #[error(transparent)]
    Raft(#[from] RaftError),

    /// The driver has stopped.
    #[error("shard {0} driver is not running")]
    Stopped(ShardId),

    /// The driver did not answer in time.
    #[error("shard {0} driver timed out")]
    Timeout(ShardId),
}

/// Commands accepted by a running driver.
#[derive(Debug)]
pub enum ShardCommand {
    /// Propose an entry; answered with its index once durable locally.
    Propose {
        /// Entry payload.
        data: Bytes,
        /// Reply channel.
        reply: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    /// Report the shard's status.
    Status {
        /// Reply channel.
        reply: oneshot::Sender<ShardStatus>,
    },
    /// Compact the log through an applied index.
    Compact {
        /// Compaction point.
        index: LogIndex,
        /// Reply channel.
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    /// Hand a message to the leader-local delegate.
    Delegate {
        /// Application payload.
        message: Bytes,
    },
    /// Stop the driver.
    Shutdown,
}

/// Cloneable handle to a running shard driver.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    shard_id: ShardId,
    node_id: NodeId,
    commands: mpsc::Sender<ShardCommand>,
    inbound: mpsc::Sender<Message>,
    request_timeout: Duration,
}

impl ShardHandle {
    /// The shard this handle drives.
    #[must_use]
    pub const fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// The node hosting the shard.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Sender for inbound peer messages; register it with the transport.
    #[must_use]
    pub fn mailbox(&self) -> mpsc::Sender<Message> {
        self.inbound.clone()
    }

    /// Proposes `data`, returning the index it was appended at.
    ///
    /// # Errors
    /// Returns `Raft(NotLeader)` on a non-leader, or `Stopped`/`Timeout` if
    /// the driver is gone or unresponsive.
    pub async fn propose(&self, data: Bytes) -> Result<LogIndex, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.command(ShardCommand::Propose { data, reply }).await?;
        Ok(self.wait(rx).await??)
    }

    /// Delivers a peer message.
    ///
    /// # Errors
    /// Returns `Stopped` if the driver is gone.
    pub async fn deliver(&self, message: Message) -> Result<(), DriverError> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| DriverError::Stopped(self.shard_id))
    }

    /// Reads the shard's current status.
    ///
    /// # Errors
    /// Returns `Stopped` or `Timeout` if the driver is gone or unresponsive.
    pub async fn status(&self) -> Result<ShardStatus, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.command(ShardCommand::Status { reply }).await?;
        self.wait(rx).await
    }

    /// Compacts the shard's log through `index`.
    ///
    /// # Errors
    /// Returns `Raft` if `index` is not applied yet, or `Stopped`/`Timeout`.
    pub async fn compact(&self, index: LogIndex) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.command(ShardCommand::Compact { index, reply }).await?;
        Ok(self.wait(rx).await??)
    }

    /// Sends an application message to the shard's leader-local delegate.
    ///
    /// # Errors
    /// Returns `Stopped` if the driver is gone.
    pub async fn delegate_message(&self, message: Bytes) -> Result<(), DriverError> {
        self.command(ShardCommand::Delegate { message }).await
    }

    /// Asks the driver to stop. Stopping an already stopped driver is not an error.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ShardCommand::Shutdown).await;
    }

    async fn command(&self, command: ShardCommand) -> Result<(), DriverError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DriverError::Stopped(self.shard_id))
    }

    async fn wait<R>(&self, rx: oneshot::Receiver<R>) -> Result<R, DriverError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DriverError::Stopped(self.shard_id)),
            Err(_) => Err(DriverError::Timeout(self.shard_id)),
        }
    }
}

/// Runs one shard's state machine.
pub struct ShardDriver<L, T, Tr, Li> {
    shard_id: ShardId,
    node: RaftNode<L, T>,
    transport: Tr,
    listener: Li,
    delegate: Option<Box<dyn LeaderLocalDelegate>>,
    /// Leadership as last reported to the delegate.
    delegate_leading: bool,
    inbound: mpsc::Receiver<Message>,
    commands: mpsc::Receiver<ShardCommand>,
    election_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
}

impl<L, T, Tr, Li> ShardDriver<L, T, Tr, Li>
where
    L: LogStore + Send + 'static,
    T: TermStore + Send + 'static,
    Tr: Transport,
    Li: RaftListener,
{
    /// Creates a driver and the handle that controls it.
    #[must_use]
    pub fn new(
        shard_id: ShardId,
        node: RaftNode<L, T>,
        transport: Tr,
        listener: Li,
        queue_capacity: usize,
        request_timeout: Duration,
    ) -> (Self, ShardHandle) {
        let (inbound_tx, inbound) = mpsc::channel(queue_capacity);
        let (commands_tx, commands) = mpsc::channel(queue_capacity);
        let handle = ShardHandle {
            shard_id,
            node_id: node.node_id(),
            commands: commands_tx,
            inbound: inbound_tx,
            request_timeout,
        };
        let driver = Self {
            shard_id,
            node,
            transport,
            listener,
            delegate: None,
            delegate_leading: false,
            inbound,
            commands,
            election_deadline: None,
            heartbeat_deadline: None,
        };
        (driver, handle)
    }

    /// Registers the shard's leader-local delegate.
    #[must_use]
    pub fn with_delegate(mut self, delegate: Box<dyn LeaderLocalDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Runs until shut down, returning the node so its stores can be reused.
    ///
    /// # Errors
    /// Returns `Raft(Storage)` if a durable write failed. The node is dropped.
    pub async fn run(mut self) -> Result<RaftNode<L, T>, DriverError> {
        let node_id = self.node.node_id();
        info!(node = %node_id, shard = %self.shard_id, "Shard driver started");

        let outputs = self.node.start();
        self.execute(outputs).await;

        loop {
            let election = sleep_until(self.election_deadline);
            let heartbeat = sleep_until(self.heartbeat_deadline);

            let result = tokio::select! {
                Some(message) = self.inbound.recv() => self.node.handle_message(message),
                command = self.commands.recv() => match command {
                    None | Some(ShardCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                () = election => {
                    self.election_deadline = None;
                    self.node.handle_election_timeout()
                }
                () = heartbeat => {
                    self.heartbeat_deadline = None;
                    self.node.handle_heartbeat_timeout()
                }
            };

            match result {
                Ok(outputs) => self.execute(outputs).await,
                Err(err) => {
                    error!(
                        node = %node_id,
                        shard = %self.shard_id,
                        error = %err,
                        "Shard stopped after persistence failure"
                    );
                    return Err(err.into());
                }
            }
        }

        info!(node = %node_id, shard = %self.shard_id, "Shard driver stopped");
        Ok(self.node)
    }

    /// Handles one command, returning any outputs it produced.
    fn handle_command(&mut self, command: ShardCommand) -> Result<Vec<RaftOutput>, RaftError> {
        match command {
            ShardCommand::Propose { data, reply } => match self.node.propose(data) {
                Ok((index, outputs)) => {
                    let _ = reply.send(Ok(index));
                    Ok(outputs)
                }
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    let _ = reply.send(Err(err));
                    Ok(Vec::new())
                }
            },
            ShardCommand::Status { reply } => {
                let _ = reply.send(ShardStatus::of(self.shard_id, &self.node));
                Ok(Vec::new())
            }
            ShardCommand::Compact { index, reply } => {
                let _ = reply.send(self.node.compact_log(index));
                Ok(Vec::new())
            }
            ShardCommand::Delegate { message } => {
                let is_leader = self.node.is_leader();
                match self.delegate.as_mut() {
                    Some(delegate) => delegate.on_message(self.shard_id, message, is_leader),
                    None => debug!(shard = %self.shard_id, "No delegate registered; dropping message"),
                }
                Ok(Vec::new())
            }
            ShardCommand::Shutdown => Ok(Vec::new()),
        }
    }

    /// Tells the delegate about a leadership change. Candidate to follower is not one.
    fn notify_leadership(&mut self, is_leader: bool) {
        if self.delegate_leading == is_leader {
            return;
        }
        self.delegate_leading = is_leader;
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.on_leadership_change(self.shard_id, is_leader);
        }
    }

    /// Carries out outputs: timers first, then callbacks, then sends.
    async fn execute(&mut self, outputs: Vec<RaftOutput>) {
        let mut sends = Vec::new();

        for output in &outputs {
            let now = Instant::now();
            match output {
                RaftOutput::ResetElectionTimer { timeout } => {
                    self.election_deadline = Some(now + *timeout);
                }
                RaftOutput::CancelElectionTimer => self.election_deadline = None,
                RaftOutput::ResetHeartbeatTimer { interval } => {
                    self.heartbeat_deadline = Some(now + *interval);
                }
                RaftOutput::CancelHeartbeatTimer => self.heartbeat_deadline = None,
                _ => {}
            }
        }

        for output in outputs {
            match output {
                RaftOutput::BecameLeader { term } => {
                    self.listener.on_became_leader(self.shard_id, term);
                    self.notify_leadership(true);
                }
                RaftOutput::BecameFollower { term, leader } => {
                    self.listener.on_became_follower(self.shard_id, term, leader);
                    self.notify_leadership(false);
                }
                RaftOutput::CommitIndexAdvanced { index } => {
                    self.listener.on_commit_index_advanced(self.shard_id, index);
                }
                RaftOutput::Apply(entry) => self.listener.apply(self.shard_id, &entry),
                RaftOutput::SnapshotRequired {
                    peer,
                    snapshot_index,
                } => {
                    warn!(
                        shard = %self.shard_id,
                        peer = %peer,
                        snapshot_index = snapshot_index.get(),
                        "Peer requires a snapshot"
                    );
                    self.listener
                        .on_snapshot_required(self.shard_id, peer, snapshot_index);
                }
                RaftOutput::Send(message) => sends.push(message),
                RaftOutput::ResetElectionTimer { .. }
                | RaftOutput::CancelElectionTimer
                | RaftOutput::ResetHeartbeatTimer { .. }
                | RaftOutput::CancelHeartbeatTimer => {}
            }
        }

        for message in sends {
            let to = message.to();
            let kind = message.kind();
            if let Err(err) = self
                .transport
                .send(to, ShardMessage::new(self.shard_id, message))
                .await
            {
                debug!(
                    shard = %self.shard_id,
                    to = %to,
                    kind,
                    error = %err,
                    "Message dropped"
                );
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use shoal_raft::{
        AppendEntries, MemoryLog, MemoryTermStore, RaftConfig, Role, StorageError, StorageResult,
    };
    use shoal_core::TermId;

    use super::*;
    use crate::listener::{ChannelListener, ListenerEvent};
    use crate::transport::LocalNetwork;

    fn single_node_driver(election: Duration) -> (
        ShardDriver<MemoryLog, MemoryTermStore, crate::transport::LocalTransport, ChannelListener>,
        ShardHandle,
        mpsc::UnboundedReceiver<ListenerEvent>,
    ) {
        let config = RaftConfig::new(NodeId::new(1), [])
            .with_election_timeout(election, election * 2)
            .with_heartbeat_interval(Duration::from_millis(5));
        let node = RaftNode::new(&config, MemoryLog::new(), MemoryTermStore::new()).unwrap();
        let network = LocalNetwork::new();
        let (listener, events) = ChannelListener::new(NodeId::new(1));
        let (driver, handle) = ShardDriver::new(
            ShardId::new(1),
            node,
            network.transport(NodeId::new(1)),
            listener,
            16,
            Duration::from_secs(1),
        );
        (driver, handle, events)
    }

    async fn wait_for_leader(handle: &ShardHandle) {
        for _ in 0..100 {
            if handle.status().await.unwrap().role == Role::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    #[tokio::test]
    async fn test_single_node_elects_and_applies() {
        let (driver, handle, mut events) = single_node_driver(Duration::from_millis(20));
        let task = tokio::spawn(driver.run());

        wait_for_leader(&handle).await;
        let index = handle.propose(Bytes::from("hello")).await.unwrap();
        assert_eq!(index, LogIndex::new(1));

        loop {
            match events.recv().await.unwrap() {
                ListenerEvent::Applied { entry, .. } => {
                    assert_eq!(entry.index, index);
                    assert_eq!(entry.data, Bytes::from("hello"));
                    break;
                }
                _ => continue,
            }
        }

        handle.shutdown().await;
        let node = task.await.unwrap().unwrap();
        assert_eq!(node.commit_index(), LogIndex::new(1));
    }

    #[tokio::test]
    async fn test_propose_before_election_is_refused() {
        let (driver, handle, _events) = single_node_driver(Duration::from_secs(10));
        let task = tokio::spawn(driver.run());

        let result = handle.propose(Bytes::from("early")).await;
        assert!(matches!(
            result,
            Err(DriverError::Raft(RaftError::NotLeader { .. }))
        ));

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stopped_driver_reports_stopped() {
        let (driver, handle, _events) = single_node_driver(Duration::from_millis(20));
        let task = tokio::spawn(driver.run());
        handle.shutdown().await;
        task.await.unwrap().unwrap();

        assert!(matches!(
            handle.status().await,
            Err(DriverError::Stopped(_))
        ));
    }

    #[derive(Default)]
    struct RecordingDelegate {
        changes: Arc<Mutex<Vec<bool>>>,
        messages: Arc<Mutex<Vec<(Bytes, bool)>>>,
    }

    impl LeaderLocalDelegate for RecordingDelegate {
        fn on_leadership_change(&mut self, _shard: ShardId, is_leader: bool) {
            self.changes.lock().unwrap().push(is_leader);
        }

        fn on_message(&mut self, _shard: ShardId, message: Bytes, is_leader: bool) {
            self.messages.lock().unwrap().push((message, is_leader));
        }
    }

    #[tokio::test]
    async fn test_delegate_sees_leadership_and_messages() {
        let (driver, handle, _events) = single_node_driver(Duration::from_millis(20));
        let delegate = RecordingDelegate::default();
        let changes = Arc::clone(&delegate.changes);
        let messages = Arc::clone(&delegate.messages);
        let task = tokio::spawn(driver.with_delegate(Box::new(delegate)).run());

        wait_for_leader(&handle).await;
        handle.delegate_message(Bytes::from("ping")).await.unwrap();
        // Status is answered after the delegate message, so it has been handled.
        handle.status().await.unwrap();

        assert_eq!(*changes.lock().unwrap(), vec![true]);
        assert_eq!(*messages.lock().unwrap(), vec![(Bytes::from("ping"), true)]);

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_delegate_not_told_when_candidate_steps_down() {
        let config = RaftConfig::new(NodeId::new(1), [NodeId::new(2), NodeId::new(3)])
            .with_election_timeout(Duration::from_millis(100), Duration::from_millis(200))
            .with_heartbeat_interval(Duration::from_millis(20));
        let node = RaftNode::new(&config, MemoryLog::new(), MemoryTermStore::new()).unwrap();
        let network = LocalNetwork::new();
        let (listener, _events) = ChannelListener::new(NodeId::new(1));
        let (driver, handle) = ShardDriver::new(
            ShardId::new(1),
            node,
            network.transport(NodeId::new(1)),
            listener,
            16,
            Duration::from_secs(1),
        );
        let delegate = RecordingDelegate::default();
        let changes = Arc::clone(&delegate.changes);
        let task = tokio::spawn(driver.with_delegate(Box::new(delegate)).run());

        // Peers never answer, so node 1 stays a candidate.
        loop {
            if handle.status().await.unwrap().role == Role::Candidate {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let leader_heartbeat = AppendEntries::heartbeat(
            TermId::new(50),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            LogIndex::new(0),
        );
        handle
            .deliver(Message::AppendEntries(leader_heartbeat))
            .await
            .unwrap();
        // Inbound messages and commands race in the select loop.
        let status = loop {
            let status = handle.status().await.unwrap();
            if status.role == Role::Follower {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(status.current_term, TermId::new(50));
        assert_eq!(status.leader_id, Some(NodeId::new(2)));
        assert!(changes.lock().unwrap().is_empty());

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_compaction_through_handle() {
        let (driver, handle, _events) = single_node_driver(Duration::from_millis(20));
        let task = tokio::spawn(driver.run());
        wait_for_leader(&handle).await;

        handle.propose(Bytes::from("a")).await.unwrap();
        handle.propose(Bytes::from("b")).await.unwrap();
        handle.compact(LogIndex::new(2)).await.unwrap();
        assert!(matches!(
            handle.compact(LogIndex::new(5)).await,
            Err(DriverError::Raft(RaftError::CompactBeyondApplied { .. }))
        ));

        handle.shutdown().await;
        let node = task.await.unwrap().unwrap();
        assert_eq!(node.log().snapshot_index(), LogIndex::new(2));
    }

    /// Term store whose disk has gone away.
    #[derive(Debug, Default)]
    struct BrokenDisk {
        inner: MemoryTermStore,
    }

    impl TermStore for BrokenDisk {
        fn current_term(&self) -> TermId {
            self.inner.current_term()
        }

        fn voted_for(&self) -> Option<NodeId> {
            self.inner.voted_for()
        }

        fn set_current_term(&mut self, _term: TermId) -> StorageResult<()> {
            Err(StorageError::io("write term", &std::io::Error::other("disk gone")))
        }

        fn set_voted_for(&mut self, _candidate: Option<NodeId>) -> StorageResult<()> {
            Err(StorageError::io("write vote", &std::io::Error::other("disk gone")))
        }

        fn set_term_and_vote(
            &mut self,
            _term: TermId,
            _candidate: Option<NodeId>,
        ) -> StorageResult<()> {
            Err(StorageError::io("write term", &std::io::Error::other("disk gone")))
        }
    }

    #[tokio::test]
    async fn test_storage_failure_stops_driver() {
        let config = RaftConfig::new(NodeId::new(1), [])
            .with_election_timeout(Duration::from_millis(10), Duration::from_millis(20))
            .with_heartbeat_interval(Duration::from_millis(5));
        let node = RaftNode::new(&config, MemoryLog::new(), BrokenDisk::default()).unwrap();
        let network = LocalNetwork::new();
        let (driver, handle) = ShardDriver::new(
            ShardId::new(1),
            node,
            network.transport(NodeId::new(1)),
            crate::listener::NoopListener,
            16,
            Duration::from_secs(1),
        );

        let result = tokio::spawn(driver.run()).await.unwrap();
        assert!(matches!(
            result,
            Err(DriverError::Raft(RaftError::Storage(_)))
        ));
        assert!(matches!(
            handle.propose(Bytes::from("late")).await,
            Err(DriverError::Stopped(_))
        ));
    }
}
