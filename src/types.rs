//! Core type definitions for the cohort consensus core.
//!
//! This module contains the fundamental data types used throughout cohort:
//! log entries and commands, cluster membership, and the identifier aliases
//! shared by every component.
//!
//! # Type Aliases
//!
//! - [`NodeId`] = `u64`: cluster node identifier
//! - [`Term`] = `u64`: election epoch, monotonically increasing
//! - [`LogIndex`] = `u64`: replicated log position, starting at 1
//! - [`Caller`] = `u64`: opaque token naming a waiting client
//! - [`WriterId`] = `u64`: a locally named producer of WAL records
//!
//! Index 0 / term 0 denote "before the log".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Unique identifier for a node in the cluster.
pub type NodeId = u64;

/// Election epoch; monotonically increasing.
pub type Term = u64;

/// Position within the replicated log.
pub type LogIndex = u64;

/// Opaque token naming a client waiting on a reply or notification.
///
/// The driver maps tokens to in-process reply channels. Tokens are
/// serialized into log entries so a restarted leader can still emit
/// notify effects for entries it finds in its log.
pub type Caller = u64;

/// A locally named producer of WAL records, typically one per node.
pub type WriterId = u64;

/// How a client command is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyMode {
    /// Reply with `(index, term)` as soon as the entry is in the log.
    AfterLogAppend,
    /// Reply with the apply result once the entry reaches consensus.
    AwaitConsensus,
    /// Fire a notify effect (no blocking caller) once applied.
    NotifyOnConsensus,
}

/// A command carried by a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Opaque application command.
    User {
        caller: Caller,
        #[serde(with = "arc_bytes")]
        payload: Arc<Vec<u8>>,
        mode: ReplyMode,
    },
    /// Consistent read evaluated against the state machine on apply.
    Query {
        caller: Caller,
        #[serde(with = "arc_bytes")]
        query: Arc<Vec<u8>>,
        mode: ReplyMode,
    },
    /// Single-server cluster membership change.
    ClusterChange {
        caller: Caller,
        members: Vec<NodeId>,
        mode: ReplyMode,
    },
    /// Inserted by a new leader on election to commit its term.
    Noop,
}

impl Command {
    /// Create a user command with the given reply mode.
    pub fn user(caller: Caller, payload: Vec<u8>, mode: ReplyMode) -> Self {
        Command::User { caller, payload: Arc::new(payload), mode }
    }

    /// Create a consistent-read command.
    pub fn query(caller: Caller, query: Vec<u8>, mode: ReplyMode) -> Self {
        Command::Query { caller, query: Arc::new(query), mode }
    }

    /// Create a membership-change command naming the full new member set.
    pub fn cluster_change(caller: Caller, members: Vec<NodeId>, mode: ReplyMode) -> Self {
        Command::ClusterChange { caller, members, mode }
    }

    pub fn is_cluster_change(&self) -> bool {
        matches!(self, Command::ClusterChange { .. })
    }

    /// The caller waiting on this command, if any.
    pub fn caller(&self) -> Option<Caller> {
        match self {
            Command::User { caller, .. }
            | Command::Query { caller, .. }
            | Command::ClusterChange { caller, .. } => Some(*caller),
            Command::Noop => None,
        }
    }
}

/// Serde helper module for Arc<Vec<u8>> serialization.
/// Serializes as raw bytes, deserializes into Arc-wrapped Vec.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The index of this entry in the log.
    pub index: LogIndex,
    /// The term when the entry was appended.
    pub term: Term,
    /// The command carried by the entry.
    pub command: Command,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Command) -> Self {
        Self { index, term, command }
    }

    /// Serialize the entry's command for WAL storage.
    pub fn encode_command(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(&self.command)?)
    }

    /// Reconstruct an entry from a WAL record's payload.
    pub fn decode(index: LogIndex, term: Term, data: &[u8]) -> crate::Result<Self> {
        let command = bincode::deserialize(data)?;
        Ok(Self { index, term, command })
    }
}

/// Replication progress the leader tracks per cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    /// Highest log index known replicated on the peer.
    pub match_index: LogIndex,
    /// Next log index the leader will send to the peer.
    pub next_index: LogIndex,
}

impl PeerState {
    pub fn new(next_index: LogIndex) -> Self {
        Self { match_index: 0, next_index }
    }
}

/// Cluster membership: every member (including self) mapped to its
/// replication progress.
///
/// Contains at least one entry; the self id may be absent only while a
/// leader that removed itself drains the removal entry to commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    members: HashMap<NodeId, PeerState>,
}

impl Cluster {
    /// Build a cluster from a member list; progress starts at zero.
    pub fn new(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let members = ids.into_iter().map(|id| (id, PeerState::new(1))).collect();
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    /// Member ids other than `this`, in unspecified order.
    pub fn peer_ids(&self, this: NodeId) -> Vec<NodeId> {
        self.members.keys().copied().filter(|&id| id != this).collect()
    }

    pub fn peer(&self, id: NodeId) -> Option<&PeerState> {
        self.members.get(&id)
    }

    pub fn peer_mut(&mut self, id: NodeId) -> Option<&mut PeerState> {
        self.members.get_mut(&id)
    }

    /// Votes needed for a majority of this cluster.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Reset all progress on becoming leader: `match_index = 0`,
    /// `next_index` = the leader's next log index.
    pub fn reset_progress(&mut self, next_index: LogIndex) {
        for peer in self.members.values_mut() {
            *peer = PeerState { match_index: 0, next_index };
        }
    }

    /// Match indices of all members except `this`.
    pub fn match_indices_except(&self, this: NodeId) -> Vec<LogIndex> {
        self.members
            .iter()
            .filter(|(&id, _)| id != this)
            .map(|(_, p)| p.match_index)
            .collect()
    }

    /// Validate that `new_members` differs from this cluster by at most one
    /// server. Joint consensus is not supported.
    pub fn is_single_step_change(&self, new_members: &[NodeId]) -> bool {
        let added = new_members.iter().filter(|id| !self.contains(**id)).count();
        let removed = self
            .members
            .keys()
            .filter(|id| !new_members.contains(id))
            .count();
        added + removed <= 1
    }

    /// Rebuild membership from a member list, preserving progress for
    /// members that survive and starting fresh ones at `next_index`.
    pub fn apply_membership(&mut self, new_members: &[NodeId], next_index: LogIndex) {
        let mut members = HashMap::with_capacity(new_members.len());
        for &id in new_members {
            let peer = self
                .members
                .get(&id)
                .copied()
                .unwrap_or_else(|| PeerState::new(next_index));
            members.insert(id, peer);
        }
        self.members = members;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_size() {
        assert_eq!(Cluster::new([1, 2, 3]).quorum_size(), 2);
        assert_eq!(Cluster::new([1, 2, 3, 4, 5]).quorum_size(), 3);
        assert_eq!(Cluster::new([1]).quorum_size(), 1);
    }

    #[test]
    fn test_single_step_change() {
        let cluster = Cluster::new([1, 2, 3]);
        assert!(cluster.is_single_step_change(&[1, 2, 3, 4])); // add one
        assert!(cluster.is_single_step_change(&[1, 2])); // remove one
        assert!(cluster.is_single_step_change(&[1, 2, 3])); // no-op
        assert!(!cluster.is_single_step_change(&[1, 2, 4, 5])); // add two, remove one
        assert!(!cluster.is_single_step_change(&[1])); // remove two
    }

    #[test]
    fn test_apply_membership_preserves_progress() {
        let mut cluster = Cluster::new([1, 2, 3]);
        cluster.peer_mut(2).unwrap().match_index = 7;

        cluster.apply_membership(&[1, 2, 4], 10);
        assert_eq!(cluster.peer(2).unwrap().match_index, 7);
        assert_eq!(cluster.peer(4).unwrap().match_index, 0);
        assert_eq!(cluster.peer(4).unwrap().next_index, 10);
        assert!(!cluster.contains(3));
    }

    #[test]
    fn test_entry_command_round_trip() {
        let entry = LogEntry::new(3, 2, Command::user(9, vec![1, 2, 3], ReplyMode::AwaitConsensus));
        let bytes = entry.encode_command().unwrap();
        let decoded = LogEntry::decode(3, 2, &bytes).unwrap();
        match decoded.command {
            Command::User { caller, payload, mode } => {
                assert_eq!(caller, 9);
                assert_eq!(*payload, vec![1, 2, 3]);
                assert_eq!(mode, ReplyMode::AwaitConsensus);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
