//! Leader role handlers.
//!
//! On election the leader resets every peer's progress and appends a noop
//! at its term; committing that noop is what re-opens cluster changes.
//! Client commands append to the log and pipeline out to peers; commit
//! advances by the quorum rule, counting only entries of the current term,
//! with the leader's own durable watermark standing in for its match index.

use super::message::{
    AppendEntriesReply, AppendEntriesRequest, Effect, InstallSnapshotRequest, NodeMsg, PeerMsg,
    ReplyValue,
};
use super::{two_leaders_error, NodeState, Role};
use crate::error::Result;
use crate::log::AppendOutcome;
use crate::machine::StateMachine;
use crate::types::{Command, LogEntry, LogIndex, NodeId, ReplyMode, Term};
use tracing::{debug, info, warn};

/// Finish an election: reset peer progress, clear campaign state, and
/// append a noop to commit the new term.
pub(super) fn become_leader<M: StateMachine>(
    state: &mut NodeState<M>,
    mut effects: Vec<Effect>,
) -> Result<(Role, Vec<Effect>)> {
    let next_index = state.log.next_index();
    state.cluster.reset_progress(next_index);
    state.votes.clear();
    state.leader_id = None;
    state.cluster_change_permitted = false;

    info!(
        node_id = state.id,
        term = state.current_term,
        "Won election, became leader"
    );

    effects.push(Effect::NextEvent(Box::new(NodeMsg::Command(Command::Noop))));
    Ok((Role::Leader, effects))
}

pub(super) fn handle<M: StateMachine>(
    state: &mut NodeState<M>,
    msg: NodeMsg,
) -> Result<(Role, Vec<Effect>)> {
    match msg {
        NodeMsg::Command(cmd) => handle_command(state, cmd),
        NodeMsg::Written { from, to, term } => {
            state.log.handle_written(from, to, term);
            advance_commit(state)
        }
        NodeMsg::ResendWrite { from } => {
            state.log.handle_resend(from)?;
            Ok((Role::Leader, Vec::new()))
        }
        NodeMsg::AppendEntriesReply { from, reply } => handle_append_reply(state, from, reply),
        NodeMsg::InstallSnapshotReply { from, reply } => {
            if reply.term < state.current_term {
                return Ok((Role::Leader, Vec::new()));
            }
            let Some(peer) = state.cluster.peer_mut(from) else {
                warn!(node_id = state.id, from, "Snapshot reply from unknown peer");
                return Ok((Role::Leader, Vec::new()));
            };
            peer.match_index = peer.match_index.max(reply.last_index);
            peer.next_index = peer.next_index.max(reply.last_index + 1);
            advance_commit(state)
        }
        NodeMsg::AppendEntries(req) => {
            if req.term < state.current_term {
                let (last_index, last_term) = state.log.last_index_term();
                return Ok((
                    Role::Leader,
                    vec![Effect::SendMsg {
                        to: req.leader_id,
                        msg: PeerMsg::AppendEntriesReply(AppendEntriesReply {
                            term: state.current_term,
                            success: false,
                            next_index: last_index + 1,
                            last_index,
                            last_term,
                        }),
                    }],
                ));
            }
            // Same term: election safety is broken.
            Err(two_leaders_error(state.id, state.current_term, req.leader_id))
        }
        NodeMsg::RequestVote(req) => {
            // Higher terms were handled before dispatch; an equal or lower
            // term gets a rejection from a working leader.
            Ok((
                Role::Leader,
                vec![Effect::SendMsg {
                    to: req.candidate_id,
                    msg: PeerMsg::RequestVoteReply(super::message::RequestVoteReply {
                        term: state.current_term,
                        vote_granted: false,
                    }),
                }],
            ))
        }
        NodeMsg::HeartbeatTimeout => {
            let effects = replication_effects(state, false, None)?;
            Ok((Role::Leader, effects))
        }
        other => {
            debug!(node_id = state.id, msg = ?other, "Leader ignoring message");
            Ok((Role::Leader, Vec::new()))
        }
    }
}

fn handle_command<M: StateMachine>(
    state: &mut NodeState<M>,
    cmd: Command,
) -> Result<(Role, Vec<Effect>)> {
    if let Command::ClusterChange { caller, members, .. } = &cmd {
        if !state.cluster_change_permitted {
            debug!(
                node_id = state.id,
                "Cluster change deferred until the pending change commits"
            );
            state.pending_cluster_changes.push_back(cmd);
            return Ok((Role::Leader, Vec::new()));
        }
        if !state.cluster.is_single_step_change(members) {
            return Ok((
                Role::Leader,
                vec![Effect::Reply {
                    to: *caller,
                    value: ReplyValue::Rejected(
                        "only single-server membership changes are permitted".to_string(),
                    ),
                }],
            ));
        }
    }

    let index = state.log.next_index();
    let term = state.current_term;
    let entry = LogEntry::new(index, term, cmd.clone());
    let outcome = state.log.append(&entry, false)?;

    let mut effects = Vec::new();
    match &cmd {
        Command::ClusterChange { caller, members, mode } => {
            state.previous_cluster = Some((index, term, state.cluster.clone()));
            let next_index = state.log.next_index();
            state.cluster.apply_membership(members, next_index);
            state.cluster_index_term = (index, term);
            state.cluster_change_permitted = false;
            info!(
                node_id = state.id,
                index,
                members = members.len(),
                "Appended cluster change"
            );
            push_append_ack(&mut effects, *caller, *mode, index, term);
        }
        Command::User { caller, mode, .. } | Command::Query { caller, mode, .. } => {
            push_append_ack(&mut effects, *caller, *mode, index, term);
        }
        Command::Noop => {}
    }

    if let AppendOutcome::Written { from, to, term } = outcome {
        effects.push(Effect::NextEvent(Box::new(NodeMsg::Written { from, to, term })));
    }
    effects.extend(replication_effects(state, false, None)?);
    Ok((Role::Leader, effects))
}

fn push_append_ack(
    effects: &mut Vec<Effect>,
    caller: crate::types::Caller,
    mode: ReplyMode,
    index: LogIndex,
    term: Term,
) {
    match mode {
        ReplyMode::AfterLogAppend => effects.push(Effect::Reply {
            to: caller,
            value: ReplyValue::Appended { index, term },
        }),
        ReplyMode::AwaitConsensus | ReplyMode::NotifyOnConsensus => {
            effects.push(Effect::Monitor { caller });
        }
    }
}

fn handle_append_reply<M: StateMachine>(
    state: &mut NodeState<M>,
    from: NodeId,
    reply: AppendEntriesReply,
) -> Result<(Role, Vec<Effect>)> {
    if reply.term < state.current_term {
        return Ok((Role::Leader, Vec::new()));
    }
    if state.cluster.peer(from).is_none() {
        warn!(node_id = state.id, from, "Reply from unknown peer, ignoring");
        return Ok((Role::Leader, Vec::new()));
    }

    if reply.success {
        if let Some(peer) = state.cluster.peer_mut(from) {
            peer.match_index = peer.match_index.max(reply.last_index);
            peer.next_index = peer.next_index.max(reply.next_index);
        }
        return advance_commit(state);
    }

    // Reconcile next_index for a failed consistency check.
    let (matched, next) = match state.cluster.peer(from) {
        Some(peer) => (peer.match_index, peer.next_index),
        None => return Ok((Role::Leader, Vec::new())),
    };

    if state.log.exists(reply.last_index, reply.last_term) && reply.last_index >= matched {
        // The follower's tail is a prefix of ours; jump straight there.
        if let Some(peer) = state.cluster.peer_mut(from) {
            peer.match_index = reply.last_index;
            peer.next_index = reply.next_index.max(reply.last_index + 1);
        }
    } else if reply.last_index < matched {
        // The follower lost state it once acknowledged; start over from
        // what it reports. Conservative reset, no demotion.
        warn!(
            node_id = state.id,
            from,
            reported = reply.last_index,
            matched,
            "Peer reports less log than previously matched, resetting"
        );
        if let Some(peer) = state.cluster.peer_mut(from) {
            peer.match_index = reply.last_index;
            peer.next_index = reply.last_index + 1;
        }
    } else {
        // Probe backwards toward the divergence point.
        let target = next
            .saturating_sub(1)
            .min(reply.last_index)
            .max(matched)
            .max(1);
        if let Some(peer) = state.cluster.peer_mut(from) {
            peer.next_index = target;
        }
    }

    let effects = replication_effects(state, true, Some(from))?;
    Ok((Role::Leader, effects))
}

/// Re-evaluate the commit index from peer match indices plus our own
/// durable watermark, apply what newly committed, and stop if a committed
/// cluster change removed this node.
fn advance_commit<M: StateMachine>(state: &mut NodeState<M>) -> Result<(Role, Vec<Effect>)> {
    let (last_written, _) = state.log.last_written();
    let mut indices = state.cluster.match_indices_except(state.id);
    // Our own match is whatever the WAL has acknowledged; it keeps
    // counting even mid self-removal so the removal itself can commit.
    indices.push(last_written);
    indices.sort_unstable_by(|a, b| b.cmp(a));

    let quorum = state.cluster.quorum_size();
    let mut effects = Vec::new();

    if quorum <= indices.len() {
        let candidate = indices[quorum - 1];
        if candidate > state.commit_index {
            // Raft §5.4.2: never count replicas of prior-term entries
            // toward commitment.
            if state.log.fetch_term(candidate) == Some(state.current_term) {
                debug!(
                    node_id = state.id,
                    commit_index = candidate,
                    "Advancing commit index"
                );
                state.commit_index = candidate;
                effects.extend(state.apply_to(state.commit_index.min(last_written))?);
            }
        } else {
            // Commit may be unchanged while apply still lags the watermark.
            effects.extend(state.apply_to(state.commit_index.min(last_written))?);
        }
    }

    if !state.cluster.contains(state.id) && state.cluster_index_term.0 <= state.commit_index {
        info!(
            node_id = state.id,
            term = state.current_term,
            "Removal from cluster committed, stopping"
        );
        return Ok((Role::Stop, effects));
    }
    Ok((Role::Leader, effects))
}

/// Build AppendEntries (or snapshot sends) for peers.
///
/// `only` restricts dispatch to one peer for urgent reconciliation resends.
/// Entry-carrying sends advance `next_index` optimistically; a failure
/// reply walks it back.
fn replication_effects<M: StateMachine>(
    state: &mut NodeState<M>,
    urgent: bool,
    only: Option<NodeId>,
) -> Result<Vec<Effect>> {
    let (last_index, _) = state.log.last_index_term();
    let (snapshot_index, _) = state.log.snapshot_index_term();
    let term = state.current_term;
    let leader_commit = state.commit_index;
    let max_batch = state.replication.max_append_entries as u64;

    let mut rpcs = Vec::new();
    let mut effects = Vec::new();

    for peer_id in state.cluster.peer_ids(state.id) {
        if only.is_some_and(|target| target != peer_id) {
            continue;
        }
        let Some(peer) = state.cluster.peer(peer_id) else {
            continue;
        };
        let next_index = peer.next_index.max(1);

        if next_index <= snapshot_index {
            // The entries this peer needs are gone; ship the snapshot.
            if let Some(snapshot) = state.log.read_snapshot()? {
                debug!(node_id = state.id, peer = peer_id, "Peer behind snapshot, sending it");
                effects.push(Effect::SendMsg {
                    to: peer_id,
                    msg: PeerMsg::InstallSnapshot(InstallSnapshotRequest {
                        term,
                        leader_id: state.id,
                        snapshot,
                    }),
                });
            }
            continue;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = state.log.fetch_term(prev_log_index).unwrap_or(0);
        let entries = if next_index <= last_index {
            let to = last_index.min(next_index + max_batch - 1);
            state.log.fetch(next_index, to)?
        } else {
            Vec::new()
        };
        let advanced_to = entries.last().map(|e| e.index);

        rpcs.push((
            peer_id,
            AppendEntriesRequest {
                term,
                leader_id: state.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            },
        ));

        if let (Some(to), Some(peer)) = (advanced_to, state.cluster.peer_mut(peer_id)) {
            peer.next_index = peer.next_index.max(to + 1);
        }
    }

    if !rpcs.is_empty() {
        effects.push(Effect::SendRpcs { urgent, rpcs });
    }
    Ok(effects)
}
