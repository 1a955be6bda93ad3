//! Driver adapter: runs a node as an async task.
//!
//! The node state machine is pure; this adapter supplies everything around
//! it — election and heartbeat timers, peer RPC dispatch over a
//! [`Transport`], WAL notice delivery, caller reply routing, and monitor
//! bookkeeping. Hosts that bring their own supervision can skip this module
//! and drive [`crate::node::Node::handle`] directly.

use crate::config::TimeoutConfig;
use crate::error::{CohortError, Result};
use crate::machine::StateMachine;
use crate::node::message::{NODE_METRICS_TABLE, METRIC_APPLIED};
use crate::node::{
    AppendEntriesRequest, Effect, Node, NodeMsg, PeerMsg, ReplyValue, RequestVoteRequest, Role,
};
use crate::types::{Caller, Command, LogIndex, NodeId, ReplyMode};
use crate::wal::WalNotice;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Peer message dispatch. Sends are fire-and-forget; replies come back as
/// inbound [`NodeMsg`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_append_entries(
        &self,
        from: NodeId,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<()>;

    async fn send_vote_request(
        &self,
        from: NodeId,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<()>;

    async fn send_peer_msg(&self, from: NodeId, to: NodeId, msg: PeerMsg) -> Result<()>;
}

/// In-process transport routing messages between driver mailboxes. Backs
/// tests and single-process clusters.
#[derive(Default)]
pub struct LoopbackTransport {
    mailboxes: parking_lot::RwLock<HashMap<NodeId, UnboundedSender<NodeMsg>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, mailbox: UnboundedSender<NodeMsg>) {
        self.mailboxes.write().insert(id, mailbox);
    }

    fn deliver(&self, to: NodeId, msg: NodeMsg) -> Result<()> {
        let mailboxes = self.mailboxes.read();
        let Some(mailbox) = mailboxes.get(&to) else {
            return Err(CohortError::UnknownPeer(to));
        };
        mailbox
            .send(msg)
            .map_err(|_| CohortError::UnknownPeer(to))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_append_entries(
        &self,
        _from: NodeId,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<()> {
        self.deliver(to, NodeMsg::AppendEntries(request))
    }

    async fn send_vote_request(
        &self,
        _from: NodeId,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<()> {
        self.deliver(to, NodeMsg::RequestVote(request))
    }

    async fn send_peer_msg(&self, from: NodeId, to: NodeId, msg: PeerMsg) -> Result<()> {
        let msg = match msg {
            PeerMsg::AppendEntriesReply(reply) => NodeMsg::AppendEntriesReply { from, reply },
            PeerMsg::RequestVoteReply(reply) => NodeMsg::RequestVoteReply { from, reply },
            PeerMsg::InstallSnapshot(request) => NodeMsg::InstallSnapshot(request),
            PeerMsg::InstallSnapshotReply(reply) => NodeMsg::InstallSnapshotReply { from, reply },
        };
        self.deliver(to, msg)
    }
}

/// Requests into a running driver.
enum DriverCmd {
    Submit {
        payload: SubmitPayload,
        mode: ReplyMode,
        reply: oneshot::Sender<ReplyValue>,
    },
    Shutdown,
}

enum SubmitPayload {
    User(Vec<u8>),
    Query(Vec<u8>),
    ClusterChange(Vec<NodeId>),
}

/// Handle for submitting commands to a driven node.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: UnboundedSender<DriverCmd>,
    msg_tx: UnboundedSender<NodeMsg>,
}

impl ClientHandle {
    async fn submit(&self, payload: SubmitPayload, mode: ReplyMode) -> Result<ReplyValue> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Submit { payload, mode, reply: reply_tx })
            .map_err(|_| CohortError::Internal("driver is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CohortError::Internal("driver dropped the reply".to_string()))
    }

    /// Replicate an application command and wait per `mode`.
    pub async fn propose(&self, payload: Vec<u8>, mode: ReplyMode) -> Result<ReplyValue> {
        self.submit(SubmitPayload::User(payload), mode).await
    }

    /// Run a consistent read through the log.
    pub async fn query(&self, query: Vec<u8>) -> Result<ReplyValue> {
        self.submit(SubmitPayload::Query(query), ReplyMode::AwaitConsensus)
            .await
    }

    /// Replace the member set (single-server change).
    pub async fn change_membership(&self, members: Vec<NodeId>) -> Result<ReplyValue> {
        self.submit(SubmitPayload::ClusterChange(members), ReplyMode::AwaitConsensus)
            .await
    }

    /// Inject a raw node message (peer traffic from a host transport).
    pub fn deliver(&self, msg: NodeMsg) -> Result<()> {
        self.msg_tx
            .send(msg)
            .map_err(|_| CohortError::Internal("driver is gone".to_string()))
    }

    /// Ask the driver to stop.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(DriverCmd::Shutdown);
    }
}

/// Runs one node: owns its mailbox, timers and caller bookkeeping.
pub struct Driver<M: StateMachine, T: Transport + 'static> {
    node: Node<M>,
    transport: Arc<T>,
    timeouts: TimeoutConfig,
    cmd_rx: Option<UnboundedReceiver<DriverCmd>>,
    msg_rx: Option<UnboundedReceiver<NodeMsg>>,
    msg_tx: UnboundedSender<NodeMsg>,
    wal_notices: Option<UnboundedReceiver<WalNotice>>,
    next_caller: Caller,
    replies: HashMap<Caller, oneshot::Sender<ReplyValue>>,
    monitors: HashSet<Caller>,
    release_tx: Option<UnboundedSender<(LogIndex, Vec<u8>)>>,
}

impl<M: StateMachine, T: Transport + 'static> Driver<M, T> {
    /// Wrap a node for driving. `wal_notices` is the receive side of the
    /// channel given to the node's `WalLog`; pass `None` for in-memory
    /// logs.
    pub fn new(
        node: Node<M>,
        transport: Arc<T>,
        timeouts: TimeoutConfig,
        wal_notices: Option<UnboundedReceiver<WalNotice>>,
    ) -> (Self, ClientHandle) {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let (msg_tx, msg_rx) = unbounded_channel();
        let handle = ClientHandle { cmd_tx, msg_tx: msg_tx.clone() };
        let driver = Self {
            node,
            transport,
            timeouts,
            cmd_rx: Some(cmd_rx),
            msg_rx: Some(msg_rx),
            msg_tx,
            wal_notices,
            next_caller: 1,
            replies: HashMap::new(),
            monitors: HashSet::new(),
            release_tx: None,
        };
        (driver, handle)
    }

    /// Receive `(index, machine_state)` release-cursor hints, for the
    /// compaction collaborator.
    pub fn with_release_sink(mut self, tx: UnboundedSender<(LogIndex, Vec<u8>)>) -> Self {
        self.release_tx = Some(tx);
        self
    }

    /// The node's mailbox sender, for transports.
    pub fn mailbox(&self) -> UnboundedSender<NodeMsg> {
        self.msg_tx.clone()
    }

    /// Drive the node until it stops or a fatal error surfaces.
    pub async fn run(mut self) -> Result<()> {
        let (Some(mut cmd_rx), Some(mut msg_rx)) = (self.cmd_rx.take(), self.msg_rx.take())
        else {
            return Err(CohortError::Internal("driver already ran".to_string()));
        };
        let mut wal_rx = self.wal_notices.take();

        let mut election_deadline = Instant::now() + self.timeouts.follower_election_timeout();
        let mut heartbeat = tokio::time::interval(self.timeouts.broadcast_interval);
        let mut await_deadline: Option<Instant> = None;

        loop {
            if self.node.role == Role::Stop {
                info!(node_id = self.node.state.id, "Node stopped");
                return Ok(());
            }
            let is_leader = self.node.role == Role::Leader;
            let role_before = self.node.role;
            let far_future = Instant::now() + self.timeouts.await_condition_timeout * 64;

            tokio::select! {
                Some(cmd) = cmd_rx.recv() => match cmd {
                    DriverCmd::Submit { payload, mode, reply } => {
                        self.submit(payload, mode, reply).await?;
                    }
                    DriverCmd::Shutdown => {
                        info!(node_id = self.node.state.id, "Driver shutting down");
                        return Ok(());
                    }
                },

                Some(msg) = msg_rx.recv() => {
                    let from_leader = matches!(
                        msg,
                        NodeMsg::AppendEntries(_) | NodeMsg::InstallSnapshot(_)
                    );
                    self.dispatch(msg).await?;
                    if from_leader {
                        election_deadline =
                            Instant::now() + self.timeouts.follower_election_timeout();
                    }
                },

                Some(notice) = recv_notice(&mut wal_rx) => {
                    let msg = match notice {
                        WalNotice::Written { from, to, term } =>
                            NodeMsg::Written { from, to, term },
                        WalNotice::ResendWrite { from } =>
                            NodeMsg::ResendWrite { from },
                    };
                    self.dispatch(msg).await?;
                },

                _ = heartbeat.tick(), if is_leader => {
                    self.dispatch(NodeMsg::HeartbeatTimeout).await?;
                },

                _ = sleep_until(election_deadline), if !is_leader => {
                    self.dispatch(NodeMsg::ElectionTimeout).await?;
                    election_deadline =
                        Instant::now() + self.timeouts.candidate_election_timeout();
                },

                _ = sleep_until(await_deadline.unwrap_or(far_future)),
                    if await_deadline.is_some() => {
                    self.dispatch(NodeMsg::AwaitConditionTimeout).await?;
                },
            }

            if self.node.role != role_before {
                match self.node.role {
                    Role::AwaitCondition => {
                        await_deadline =
                            Some(Instant::now() + self.timeouts.await_condition_timeout);
                    }
                    Role::Follower => {
                        // Exiting any role into follower re-arms the
                        // election timer.
                        await_deadline = None;
                        election_deadline =
                            Instant::now() + self.timeouts.follower_election_timeout();
                    }
                    _ => await_deadline = None,
                }
            }
        }
    }

    async fn submit(
        &mut self,
        payload: SubmitPayload,
        mode: ReplyMode,
        reply: oneshot::Sender<ReplyValue>,
    ) -> Result<()> {
        let caller = self.next_caller;
        self.next_caller += 1;
        self.replies.insert(caller, reply);

        let command = match payload {
            SubmitPayload::User(payload) => Command::user(caller, payload, mode),
            SubmitPayload::Query(query) => Command::query(caller, query, mode),
            SubmitPayload::ClusterChange(members) => {
                Command::cluster_change(caller, members, mode)
            }
        };
        self.dispatch(NodeMsg::Command(command)).await
    }

    async fn dispatch(&mut self, msg: NodeMsg) -> Result<()> {
        let mut queue = VecDeque::from([msg]);
        while let Some(msg) = queue.pop_front() {
            let effects = match self.node.handle(msg) {
                Ok(effects) => effects,
                Err(e) if e.is_fatal() => {
                    error!(node_id = self.node.state.id, error = %e, "Fatal consensus error");
                    return Err(e);
                }
                Err(e) => {
                    warn!(node_id = self.node.state.id, error = %e, "Handler error");
                    continue;
                }
            };
            for effect in effects {
                self.perform(effect, &mut queue).await;
            }
        }
        Ok(())
    }

    async fn perform(&mut self, effect: Effect, queue: &mut VecDeque<NodeMsg>) {
        let id = self.node.state.id;
        match effect {
            Effect::Reply { to, value } => {
                if let Some(tx) = self.replies.remove(&to) {
                    let _ = tx.send(value);
                } else {
                    debug!(node_id = id, caller = to, "Reply for unknown caller");
                }
            }
            Effect::Notify { to, value } => {
                // Notifications share the reply channel; the caller opted
                // out of blocking, not of hearing the outcome.
                if let Some(tx) = self.replies.remove(&to) {
                    let _ = tx.send(value);
                }
            }
            Effect::SendRpcs { urgent, rpcs } => {
                for (peer, request) in rpcs {
                    if let Err(e) = self.transport.send_append_entries(id, peer, request).await {
                        if urgent {
                            warn!(node_id = id, peer, error = %e, "Urgent RPC dispatch failed");
                        } else {
                            debug!(node_id = id, peer, error = %e, "RPC dispatch failed");
                        }
                    }
                }
            }
            Effect::SendVoteRequests(requests) => {
                for (peer, request) in requests {
                    if let Err(e) = self.transport.send_vote_request(id, peer, request).await {
                        debug!(node_id = id, peer, error = %e, "Vote dispatch failed");
                    }
                }
            }
            Effect::SendMsg { to, msg } => {
                if let Err(e) = self.transport.send_peer_msg(id, to, msg).await {
                    debug!(node_id = id, peer = to, error = %e, "Send failed");
                }
            }
            Effect::Monitor { caller } => {
                self.monitors.insert(caller);
            }
            Effect::Demonitor { caller } => {
                self.monitors.remove(&caller);
            }
            Effect::NextEvent(msg) => queue.push_back(*msg),
            Effect::IncrMetrics { table, deltas } => {
                for (position, delta) in deltas {
                    if table == NODE_METRICS_TABLE && position == METRIC_APPLIED {
                        ::metrics::counter!(crate::metrics::NODE_ENTRIES_APPLIED)
                            .increment(delta);
                    }
                }
            }
            Effect::ReleaseCursor { index, machine_state } => {
                if let Some(tx) = &self.release_tx {
                    let _ = tx.send((index, machine_state));
                }
            }
        }
    }
}

async fn recv_notice(rx: &mut Option<UnboundedReceiver<WalNotice>>) -> Option<WalNotice> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
