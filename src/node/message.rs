//! Messages into the node state machine and effects out of it.
//!
//! Handlers are pure with respect to the outside world: everything a node
//! wants done (peer RPCs, caller replies, timers, monitors) is described by
//! an [`Effect`] and executed by the driver.

use crate::log::SnapshotData;
use crate::types::{Caller, Command, LogEntry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// AppendEntries RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones.
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry.
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC reply.
///
/// Success replies are sent from the written handler once the entries are
/// durable, carrying the durable watermark as `last_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// Current term, for leader to update itself.
    pub term: Term,
    /// True if the entries were accepted and durable.
    pub success: bool,
    /// Follower's next expected index.
    pub next_index: LogIndex,
    /// Follower's last (durable) log index.
    pub last_index: LogIndex,
    /// Term of the entry at `last_index`.
    pub last_term: Term,
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting vote.
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// Current term, for candidate to update itself.
    pub term: Term,
    /// True if candidate received vote.
    pub vote_granted: bool,
}

/// InstallSnapshot RPC arguments. Chunking, if any, is a transport concern;
/// the core sees whole snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID.
    pub leader_id: NodeId,
    /// The snapshot, replacing all entries up to its last index.
    pub snapshot: SnapshotData,
}

/// InstallSnapshot RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    /// Current term, for leader to update itself.
    pub term: Term,
    /// Highest index the receiver now holds.
    pub last_index: LogIndex,
}

/// Everything a node can receive.
#[derive(Debug, Clone)]
pub enum NodeMsg {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesReply { from: NodeId, reply: AppendEntriesReply },
    RequestVote(RequestVoteRequest),
    RequestVoteReply { from: NodeId, reply: RequestVoteReply },
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotReply { from: NodeId, reply: InstallSnapshotReply },
    /// Client command submitted to this node.
    Command(Command),
    /// WAL acknowledgement for this node's writes in `[from, to]`.
    Written { from: LogIndex, to: LogIndex, term: Term },
    /// WAL dropped an out-of-sequence write; resend from `from`.
    ResendWrite { from: LogIndex },
    /// Election timer fired.
    ElectionTimeout,
    /// Leader broadcast timer fired.
    HeartbeatTimeout,
    /// Await-condition timer fired.
    AwaitConditionTimeout,
    /// The host respawned the WAL sink.
    WalUp,
}

impl NodeMsg {
    /// The peer term carried by the message, for the universal term rule.
    pub fn term(&self) -> Option<Term> {
        match self {
            NodeMsg::AppendEntries(req) => Some(req.term),
            NodeMsg::AppendEntriesReply { reply, .. } => Some(reply.term),
            NodeMsg::RequestVote(req) => Some(req.term),
            NodeMsg::RequestVoteReply { reply, .. } => Some(reply.term),
            NodeMsg::InstallSnapshot(req) => Some(req.term),
            NodeMsg::InstallSnapshotReply { reply, .. } => Some(reply.term),
            _ => None,
        }
    }
}

/// Peer-directed payloads carried by [`Effect::SendMsg`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMsg {
    AppendEntriesReply(AppendEntriesReply),
    RequestVoteReply(RequestVoteReply),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotReply(InstallSnapshotReply),
}

/// Values delivered to callers through replies and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyValue {
    /// The command reached the log at `(index, term)`.
    Appended { index: LogIndex, term: Term },
    /// The command (or query) was applied; `result` is the machine's reply.
    Applied { index: LogIndex, result: Vec<u8> },
    /// This node cannot take the command.
    NotLeader { term: Term, leader: Option<NodeId> },
    /// The command was rejected outright.
    Rejected(String),
}

/// Side effects emitted by the node state machine for the driver.
#[derive(Debug)]
pub enum Effect {
    /// Answer a waiting caller.
    Reply { to: Caller, value: ReplyValue },
    /// Fire-and-forget notification for `notify_on_consensus` commands.
    Notify { to: Caller, value: ReplyValue },
    /// Dispatch AppendEntries RPCs; `urgent` requests immediate send ahead
    /// of the broadcast cadence.
    SendRpcs {
        urgent: bool,
        rpcs: Vec<(NodeId, AppendEntriesRequest)>,
    },
    /// Dispatch RequestVote RPCs.
    SendVoteRequests(Vec<(NodeId, RequestVoteRequest)>),
    /// Send a single peer-directed message.
    SendMsg { to: NodeId, msg: PeerMsg },
    /// Watch a caller for disappearance while its command is in flight.
    Monitor { caller: Caller },
    /// Stop watching a caller.
    Demonitor { caller: Caller },
    /// Re-enter the node with a synthetic message.
    NextEvent(Box<NodeMsg>),
    /// Bump metric positions in a named table.
    IncrMetrics {
        table: &'static str,
        deltas: Vec<(usize, u64)>,
    },
    /// Everything at or below `index` may be compacted; `machine_state` is
    /// a snapshot taken at that point.
    ReleaseCursor {
        index: LogIndex,
        machine_state: Vec<u8>,
    },
}

/// Position of the applied-entries counter in the node metrics table.
pub const METRIC_APPLIED: usize = 0;
/// Position of the commit-index gauge in the node metrics table.
pub const METRIC_COMMITTED: usize = 1;
/// Node metrics table name.
pub const NODE_METRICS_TABLE: &str = "cohort_node";
