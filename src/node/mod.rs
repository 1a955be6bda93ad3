//! The per-node consensus state machine.
//!
//! A node is a pure transition function: each incoming [`NodeMsg`] produces
//! a possibly-changed [`Role`], mutated [`NodeState`], and a list of
//! [`Effect`]s for the driver. Handlers never suspend; the only I/O they
//! perform goes through the log facade (WAL enqueue, metadata fsync).

// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod await_condition;
mod candidate;
mod follower;
mod leader;
pub mod message;

pub use await_condition::AwaitCondition;
pub use message::{
    AppendEntriesReply, AppendEntriesRequest, Effect, InstallSnapshotReply,
    InstallSnapshotRequest, NodeMsg, PeerMsg, ReplyValue, RequestVoteReply, RequestVoteRequest,
};

use crate::config::{CohortConfig, ReplicationConfig};
use crate::error::{CohortError, Result};
use crate::log::{LogMeta, NodeLog};
use crate::machine::StateMachine;
use crate::types::{Cluster, Command, LogIndex, NodeId, Term};
use message::{METRIC_APPLIED, NODE_METRICS_TABLE};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

/// The role a node currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive; responds to RPCs.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Handling client commands and replication.
    Leader,
    /// Suspended until a predicate on incoming messages holds.
    AwaitCondition,
    /// Removed from the cluster; the host should tear the node down.
    Stop,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
            Role::AwaitCondition => write!(f, "AwaitCondition"),
            Role::Stop => write!(f, "Stop"),
        }
    }
}

/// Complete state of one consensus node.
pub struct NodeState<M: StateMachine> {
    /// This node's ID.
    pub id: NodeId,
    /// Cluster membership including self.
    pub cluster: Cluster,
    /// Current leader, if known.
    pub leader_id: Option<NodeId>,
    /// Latest term seen. Persisted.
    pub current_term: Term,
    /// Vote granted in `current_term`. Persisted.
    pub voted_for: Option<NodeId>,
    /// Highest index known committed.
    pub commit_index: LogIndex,
    /// Highest index applied to the machine.
    pub last_applied: LogIndex,
    /// The log facade.
    pub log: Box<dyn NodeLog>,
    /// `(index, term)` of the latest committed-or-pending cluster change.
    pub cluster_index_term: (LogIndex, Term),
    /// False between appending a cluster change and committing the
    /// leader's term-boundary noop.
    pub cluster_change_permitted: bool,
    /// Deferred membership commands.
    pub pending_cluster_changes: VecDeque<Command>,
    /// Rollback state for an uncommitted cluster change.
    pub previous_cluster: Option<(LogIndex, Term, Cluster)>,
    /// Nodes that granted their vote in the current campaign.
    pub votes: HashSet<NodeId>,
    /// The user state machine.
    pub machine: M,
    /// Predicate while in the await-condition role.
    pub condition: Option<AwaitCondition>,
    /// Replication and apply tuning.
    pub replication: ReplicationConfig,
    applied_since_release: u64,
}

impl<M: StateMachine> NodeState<M> {
    /// Persist `current_term` and `voted_for` with a metadata fsync.
    pub(crate) fn persist_meta(&mut self) -> Result<()> {
        self.log.write_meta(LogMeta {
            current_term: self.current_term,
            voted_for: self.voted_for,
        })?;
        self.log.sync_meta()
    }

    /// Universal term rule: adopt the higher term and clear the vote, with
    /// the persistence fsync completing before anything else happens.
    pub(crate) fn step_down(&mut self, term: Term) -> Result<()> {
        debug_assert!(term > self.current_term);
        info!(
            node_id = self.id,
            old_term = self.current_term,
            new_term = term,
            "Observed higher term, stepping down"
        );
        self.current_term = term;
        self.voted_for = None;
        self.persist_meta()?;
        self.leader_id = None;
        self.votes.clear();
        self.condition = None;
        Ok(())
    }

    /// Whether a candidate's log is at least as up-to-date as ours.
    pub(crate) fn candidate_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let (our_index, our_term) = self.log.last_index_term();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index)
    }

    /// Apply committed entries up to `target`, dispatching each by command
    /// tag and emitting the resulting effects.
    ///
    /// `last_applied` advances to the highest applied index, which may fall
    /// short of `target` when entries are not present.
    pub(crate) fn apply_to(&mut self, target: LogIndex) -> Result<Vec<Effect>> {
        let mut effects = Vec::new();
        let mut applied: u64 = 0;

        while self.last_applied < target {
            let from = self.last_applied + 1;
            let to = target.min(from + self.replication.apply_batch_size as u64 - 1);
            let entries = self.log.fetch(from, to)?;
            let got = entries.len() as u64;
            if got == 0 {
                break;
            }

            for entry in entries {
                self.apply_one(&entry.command, entry.index, entry.term, &mut effects);
                self.last_applied = entry.index;
                applied += 1;
            }
            if got < to - from + 1 {
                break;
            }
        }

        if applied > 0 {
            effects.push(Effect::IncrMetrics {
                table: NODE_METRICS_TABLE,
                deltas: vec![(METRIC_APPLIED, applied)],
            });
            self.applied_since_release += applied;
            if self.applied_since_release >= self.replication.release_cursor_interval {
                self.applied_since_release = 0;
                self.log.update_release_cursor(self.last_applied)?;
                effects.push(Effect::ReleaseCursor {
                    index: self.last_applied,
                    machine_state: self.machine.snapshot(),
                });
            }
        }
        Ok(effects)
    }

    fn apply_one(&mut self, command: &Command, index: LogIndex, term: Term, effects: &mut Vec<Effect>) {
        match command {
            Command::User { caller, payload, mode } => {
                let result = self.machine.apply(index, payload);
                match mode {
                    crate::types::ReplyMode::AwaitConsensus => {
                        effects.push(Effect::Reply {
                            to: *caller,
                            value: ReplyValue::Applied { index, result },
                        });
                        effects.push(Effect::Demonitor { caller: *caller });
                    }
                    crate::types::ReplyMode::NotifyOnConsensus => {
                        effects.push(Effect::Notify {
                            to: *caller,
                            value: ReplyValue::Applied { index, result },
                        });
                        effects.push(Effect::Demonitor { caller: *caller });
                    }
                    crate::types::ReplyMode::AfterLogAppend => {}
                }
            }
            Command::Query { caller, query, mode } => {
                let result = self.machine.query(query);
                let value = ReplyValue::Applied { index, result };
                match mode {
                    crate::types::ReplyMode::NotifyOnConsensus => {
                        effects.push(Effect::Notify { to: *caller, value });
                    }
                    _ => effects.push(Effect::Reply { to: *caller, value }),
                }
                effects.push(Effect::Demonitor { caller: *caller });
            }
            Command::ClusterChange { caller, mode, .. } => {
                // The membership itself took effect when the entry entered
                // the log; commit makes it final.
                self.cluster_change_permitted = true;
                self.previous_cluster = None;
                match mode {
                    crate::types::ReplyMode::NotifyOnConsensus => {
                        effects.push(Effect::Notify {
                            to: *caller,
                            value: ReplyValue::Applied { index, result: Vec::new() },
                        });
                    }
                    crate::types::ReplyMode::AwaitConsensus => {
                        effects.push(Effect::Reply {
                            to: *caller,
                            value: ReplyValue::Applied { index, result: Vec::new() },
                        });
                    }
                    crate::types::ReplyMode::AfterLogAppend => {}
                }
                effects.push(Effect::Demonitor { caller: *caller });
                if let Some(next) = self.pending_cluster_changes.pop_front() {
                    effects.push(Effect::NextEvent(Box::new(NodeMsg::Command(next))));
                }
            }
            Command::Noop => {
                if term == self.current_term {
                    self.cluster_change_permitted = true;
                    if let Some(next) = self.pending_cluster_changes.pop_front() {
                        effects.push(Effect::NextEvent(Box::new(NodeMsg::Command(next))));
                    }
                }
            }
        }
    }
}

/// Effects a follower may emit from its apply path. Replies to callers are
/// the leader's job.
pub(crate) fn filter_follower_effects(effects: Vec<Effect>) -> Vec<Effect> {
    effects
        .into_iter()
        .filter(|effect| {
            matches!(
                effect,
                Effect::ReleaseCursor { .. }
                    | Effect::Monitor { .. }
                    | Effect::Demonitor { .. }
                    | Effect::IncrMetrics { .. }
            )
        })
        .collect()
}

/// A node: current role plus state, with the universal dispatch entry.
pub struct Node<M: StateMachine> {
    pub role: Role,
    pub state: NodeState<M>,
}

impl<M: StateMachine> Node<M> {
    /// Create a node from its log and machine.
    ///
    /// Reads persisted metadata, installs the snapshot if one exists, then
    /// scans forward from the snapshot for the newest cluster-change entry
    /// to derive current membership.
    pub fn init(config: &CohortConfig, log: Box<dyn NodeLog>, mut machine: M) -> Result<Self> {
        let meta = log.read_meta()?;
        let mut commit_index = 0;
        let mut cluster = Cluster::new(config.node.initial_members.iter().copied());
        let mut cluster_index_term = (0, 0);

        if let Some(snapshot) = log.read_snapshot()? {
            machine.restore(&snapshot.machine_state)?;
            commit_index = snapshot.meta.last_index;
            cluster = Cluster::new(snapshot.meta.members.iter().copied());
            cluster_index_term = (snapshot.meta.last_index, snapshot.meta.last_term);
        }

        let mut state = NodeState {
            id: config.node.id,
            cluster,
            leader_id: None,
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            commit_index,
            last_applied: commit_index,
            log,
            cluster_index_term,
            cluster_change_permitted: false,
            pending_cluster_changes: VecDeque::new(),
            previous_cluster: None,
            votes: HashSet::new(),
            machine,
            condition: None,
            replication: config.replication.clone(),
            applied_since_release: 0,
        };

        // The newest cluster change in the log overrides the snapshot's
        // configuration, committed or not.
        let (last_index, _) = state.log.last_index_term();
        let mut scan = state.commit_index + 1;
        while scan <= last_index {
            let to = last_index.min(scan + state.replication.apply_batch_size as u64 - 1);
            let entries = state.log.fetch(scan, to)?;
            if entries.is_empty() {
                break;
            }
            scan = entries.last().map(|e| e.index + 1).unwrap_or(to + 1);
            for entry in entries {
                if let Command::ClusterChange { members, .. } = &entry.command {
                    let next_index = state.log.next_index();
                    state.cluster.apply_membership(members, next_index);
                    state.cluster_index_term = (entry.index, entry.term);
                }
            }
        }

        info!(
            node_id = state.id,
            term = state.current_term,
            commit_index = state.commit_index,
            members = state.cluster.len(),
            "Node initialized"
        );
        Ok(Self { role: Role::Follower, state })
    }

    /// Dispatch one message through the current role's handler.
    ///
    /// The universal term rule runs first: any message carrying a higher
    /// term demotes to follower (with a persisted term update) before the
    /// message is handled there.
    pub fn handle(&mut self, msg: NodeMsg) -> Result<Vec<Effect>> {
        if self.role == Role::Stop {
            debug!(node_id = self.state.id, "Ignoring message after stop");
            return Ok(Vec::new());
        }

        if let Some(term) = msg.term() {
            if term > self.state.current_term {
                self.state.step_down(term)?;
                self.transition(Role::Follower);
            }
        }

        let (role, effects) = match self.role {
            Role::Follower => follower::handle(&mut self.state, msg)?,
            Role::Candidate => candidate::handle(&mut self.state, msg)?,
            Role::Leader => leader::handle(&mut self.state, msg)?,
            Role::AwaitCondition => await_condition::handle(&mut self.state, msg)?,
            Role::Stop => (Role::Stop, Vec::new()),
        };
        self.transition(role);
        Ok(effects)
    }

    fn transition(&mut self, role: Role) {
        if role != self.role {
            info!(
                node_id = self.state.id,
                term = self.state.current_term,
                from = %self.role,
                to = %role,
                "Role transition"
            );
            self.role = role;
        }
    }
}

/// Fatal condition: a second leader observed in our own term.
pub(crate) fn two_leaders_error(id: NodeId, term: Term, other: NodeId) -> CohortError {
    CohortError::SafetyViolation(format!(
        "node {} saw AppendEntries from {} in its own leadership term {}",
        id, other, term
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{MemLog, NodeLog};
    use crate::machine::FnMachine;
    use crate::types::LogEntry;

    fn test_node() -> Node<FnMachine<u64>> {
        let mut config = CohortConfig::development();
        config.node.initial_members = vec![1, 2, 3];
        let machine = FnMachine::from_fn(0u64, |_cmd: &[u8], count: &mut u64| {
            *count += 1;
            count.to_be_bytes().to_vec()
        });
        Node::init(&config, Box::new(MemLog::new()), machine).unwrap()
    }

    #[test]
    fn test_initial_state() {
        let node = test_node();
        assert_eq!(node.role, Role::Follower);
        assert_eq!(node.state.current_term, 0);
        assert!(node.state.leader_id.is_none());
        assert_eq!(node.state.cluster.len(), 3);
        assert!(!node.state.cluster_change_permitted);
    }

    #[test]
    fn test_step_down_persists_term() {
        let mut node = test_node();
        node.state.voted_for = Some(1);
        node.state.step_down(4).unwrap();

        assert_eq!(node.state.current_term, 4);
        assert_eq!(node.state.voted_for, None);
        let meta = node.state.log.read_meta().unwrap();
        assert_eq!(meta.current_term, 4);
        assert_eq!(meta.voted_for, None);
    }

    #[test]
    fn test_candidate_up_to_date() {
        let mut node = test_node();
        node.state
            .log
            .append(&LogEntry::new(1, 1, Command::Noop), false)
            .unwrap();
        node.state
            .log
            .append(&LogEntry::new(2, 2, Command::Noop), false)
            .unwrap();

        assert!(node.state.candidate_up_to_date(1, 3)); // higher term wins
        assert!(node.state.candidate_up_to_date(3, 2)); // same term, longer
        assert!(node.state.candidate_up_to_date(2, 2)); // equal
        assert!(!node.state.candidate_up_to_date(3, 1)); // lower term loses
    }

    #[test]
    fn test_apply_stops_at_missing_entries() {
        let mut node = test_node();
        node.state
            .log
            .append(&LogEntry::new(1, 1, Command::Noop), false)
            .unwrap();
        node.state.current_term = 1;
        node.state.commit_index = 5;

        // Only index 1 exists; apply must not run ahead of the log.
        node.state.apply_to(5).unwrap();
        assert_eq!(node.state.last_applied, 1);
    }

    #[test]
    fn test_release_cursor_cadence() {
        let mut node = test_node();
        node.state.replication.release_cursor_interval = 2;
        node.state.current_term = 1;
        for index in 1..=4 {
            node.state
                .log
                .append(&LogEntry::new(index, 1, Command::Noop), false)
                .unwrap();
        }
        node.state.commit_index = 4;

        let effects = node.state.apply_to(4).unwrap();
        let cursors: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::ReleaseCursor { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(cursors, vec![4]);
    }
}
