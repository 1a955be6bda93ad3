//! Follower role handlers.
//!
//! Followers verify AppendEntries consistency against their log, write the
//! new entries through the log facade, and acknowledge asynchronously: the
//! success reply is sent from the written handler once the WAL has fsynced,
//! carrying the durable watermark. A log gap or a dead WAL moves the node
//! into the await-condition role.

use super::await_condition::AwaitCondition;
use super::message::{
    AppendEntriesReply, AppendEntriesRequest, Effect, InstallSnapshotReply,
    InstallSnapshotRequest, NodeMsg, PeerMsg, ReplyValue, RequestVoteReply, RequestVoteRequest,
};
use super::{candidate, filter_follower_effects, NodeState, Role};
use crate::error::{CohortError, Result};
use crate::log::AppendOutcome;
use crate::machine::StateMachine;
use crate::types::{Cluster, Command, LogIndex, Term};
use tracing::{debug, warn};

pub(super) fn handle<M: StateMachine>(
    state: &mut NodeState<M>,
    msg: NodeMsg,
) -> Result<(Role, Vec<Effect>)> {
    match msg {
        NodeMsg::AppendEntries(req) => handle_append_entries(state, req),
        NodeMsg::Written { from, to, term } => handle_written(state, from, to, term),
        NodeMsg::ResendWrite { from } => {
            state.log.handle_resend(from)?;
            Ok((Role::Follower, Vec::new()))
        }
        NodeMsg::RequestVote(req) => handle_request_vote(state, req),
        NodeMsg::InstallSnapshot(req) => handle_install_snapshot(state, req),
        NodeMsg::ElectionTimeout => candidate::start_election(state),
        NodeMsg::Command(cmd) => {
            let mut effects = Vec::new();
            if let Some(caller) = cmd.caller() {
                effects.push(Effect::Reply {
                    to: caller,
                    value: ReplyValue::NotLeader {
                        term: state.current_term,
                        leader: state.leader_id,
                    },
                });
            }
            Ok((Role::Follower, effects))
        }
        other => {
            debug!(node_id = state.id, msg = ?other, "Follower ignoring message");
            Ok((Role::Follower, Vec::new()))
        }
    }
}

/// Outcome of the prev_log consistency check.
enum PrevCheck {
    EntryOk,
    TermMismatch,
    Missing,
}

fn check_prev<M: StateMachine>(
    state: &NodeState<M>,
    prev_log_index: LogIndex,
    prev_log_term: Term,
) -> PrevCheck {
    if prev_log_index == 0 {
        return PrevCheck::EntryOk;
    }
    let (snapshot_index, _) = state.log.snapshot_index_term();
    if prev_log_index < snapshot_index {
        // Covered by the snapshot, which only holds committed entries.
        return PrevCheck::EntryOk;
    }
    match state.log.fetch_term(prev_log_index) {
        Some(term) if term == prev_log_term => PrevCheck::EntryOk,
        Some(_) => PrevCheck::TermMismatch,
        None => PrevCheck::Missing,
    }
}

fn failure_reply<M: StateMachine>(state: &NodeState<M>) -> AppendEntriesReply {
    let (last_index, last_term) = state.log.last_index_term();
    AppendEntriesReply {
        term: state.current_term,
        success: false,
        next_index: last_index + 1,
        last_index,
        last_term,
    }
}

fn success_reply<M: StateMachine>(state: &NodeState<M>) -> AppendEntriesReply {
    let (last_index, last_term) = state.log.last_written();
    AppendEntriesReply {
        term: state.current_term,
        success: true,
        next_index: last_index + 1,
        last_index,
        last_term,
    }
}

fn handle_append_entries<M: StateMachine>(
    state: &mut NodeState<M>,
    req: AppendEntriesRequest,
) -> Result<(Role, Vec<Effect>)> {
    if req.term < state.current_term {
        let reply = failure_reply(state);
        return Ok((
            Role::Follower,
            vec![Effect::SendMsg {
                to: req.leader_id,
                msg: PeerMsg::AppendEntriesReply(reply),
            }],
        ));
    }
    state.leader_id = Some(req.leader_id);

    match check_prev(state, req.prev_log_index, req.prev_log_term) {
        PrevCheck::EntryOk => {}
        PrevCheck::TermMismatch => {
            debug!(
                node_id = state.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                "AppendEntries prev term mismatch"
            );
            let reply = failure_reply(state);
            return Ok((
                Role::Follower,
                vec![Effect::SendMsg {
                    to: req.leader_id,
                    msg: PeerMsg::AppendEntriesReply(reply),
                }],
            ));
        }
        PrevCheck::Missing => {
            debug!(
                node_id = state.id,
                prev_log_index = req.prev_log_index,
                last_index = state.log.last_index_term().0,
                "AppendEntries gap, awaiting catch-up"
            );
            state.condition = Some(AwaitCondition::CatchUp);
            let reply = failure_reply(state);
            return Ok((
                Role::AwaitCondition,
                vec![Effect::SendMsg {
                    to: req.leader_id,
                    msg: PeerMsg::AppendEntriesReply(reply),
                }],
            ));
        }
    }

    // Write entries we do not already hold; the first conflicting write
    // truncates the divergent tail.
    let mut last_received = req.prev_log_index;
    let mut wrote = 0u64;
    let mut synthetic: Option<(LogIndex, LogIndex, Term)> = None;

    for entry in &req.entries {
        last_received = entry.index;
        let existing = state.log.fetch_term(entry.index);
        if existing == Some(entry.term) {
            continue;
        }
        let truncate = entry.index <= state.log.last_index_term().0;
        if truncate {
            revert_cluster_if_overwritten(state, entry.index);
        }
        match state.log.append(entry, truncate) {
            Ok(AppendOutcome::Queued) => {}
            Ok(AppendOutcome::Written { from, to, term }) => {
                synthetic = Some(match synthetic {
                    None => (from, to, term),
                    Some((f, _, _)) => (f.min(from), to, term),
                });
            }
            Err(CohortError::WalDown) => {
                warn!(node_id = state.id, "WAL down, awaiting recovery");
                state.condition = Some(AwaitCondition::WalRecovered);
                return Ok((Role::AwaitCondition, Vec::new()));
            }
            Err(e) => return Err(e),
        }
        note_cluster_change(state, entry.index, entry.term, &entry.command);
        wrote += 1;
    }

    state.commit_index = state
        .commit_index
        .max(req.leader_commit.min(last_received));

    if wrote == 0 {
        // Heartbeat or fully duplicate batch: nothing new to wait on.
        // Advance apply against the durable watermark and acknowledge.
        let (last_written, _) = state.log.last_written();
        let apply_effects = state.apply_to(state.commit_index.min(last_written))?;
        let mut effects = filter_follower_effects(apply_effects);
        effects.push(Effect::SendMsg {
            to: req.leader_id,
            msg: PeerMsg::AppendEntriesReply(success_reply(state)),
        });
        return Ok((Role::Follower, effects));
    }

    // Durable acknowledgement arrives as a Written event. The in-memory
    // backend completes immediately, so schedule it ourselves.
    let mut effects = Vec::new();
    if let Some((from, to, term)) = synthetic {
        effects.push(Effect::NextEvent(Box::new(NodeMsg::Written { from, to, term })));
    }
    Ok((Role::Follower, effects))
}

/// A truncating write at or before the latest cluster-change entry undoes
/// that change: restore the previous membership before the replacement
/// entries are examined.
fn revert_cluster_if_overwritten<M: StateMachine>(state: &mut NodeState<M>, overwrite_at: LogIndex) {
    let Some((change_index, _, _)) = state.previous_cluster.as_ref() else {
        return;
    };
    if overwrite_at <= *change_index {
        let (_, _, previous) = state
            .previous_cluster
            .take()
            .unwrap_or_else(|| (0, 0, state.cluster.clone()));
        warn!(
            node_id = state.id,
            overwrite_at, "Cluster change overwritten, reverting membership"
        );
        state.cluster = previous;
        state.cluster_index_term = (0, 0);
    }
}

/// Membership changes take effect the moment they enter the log.
fn note_cluster_change<M: StateMachine>(
    state: &mut NodeState<M>,
    index: LogIndex,
    term: Term,
    command: &Command,
) {
    if let Command::ClusterChange { members, .. } = command {
        state.previous_cluster = Some((index, term, state.cluster.clone()));
        let next_index = state.log.next_index();
        state.cluster.apply_membership(members, next_index);
        state.cluster_index_term = (index, term);
        debug!(
            node_id = state.id,
            index,
            members = members.len(),
            "Adopted cluster change from log"
        );
    }
}

fn handle_written<M: StateMachine>(
    state: &mut NodeState<M>,
    from: LogIndex,
    to: LogIndex,
    term: Term,
) -> Result<(Role, Vec<Effect>)> {
    state.log.handle_written(from, to, term);
    let (last_written, _) = state.log.last_written();
    let apply_effects = state.apply_to(state.commit_index.min(last_written))?;
    let mut effects = filter_follower_effects(apply_effects);

    if let Some(leader) = state.leader_id {
        effects.push(Effect::SendMsg {
            to: leader,
            msg: PeerMsg::AppendEntriesReply(success_reply(state)),
        });
    }
    Ok((Role::Follower, effects))
}

fn handle_request_vote<M: StateMachine>(
    state: &mut NodeState<M>,
    req: RequestVoteRequest,
) -> Result<(Role, Vec<Effect>)> {
    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        false
    } else if !state.candidate_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        true
    };

    if vote_granted && state.voted_for != Some(req.candidate_id) {
        state.voted_for = Some(req.candidate_id);
        state.persist_meta()?;
    }

    debug!(
        node_id = state.id,
        candidate = req.candidate_id,
        term = req.term,
        vote_granted,
        "Handled RequestVote"
    );

    Ok((
        Role::Follower,
        vec![Effect::SendMsg {
            to: req.candidate_id,
            msg: PeerMsg::RequestVoteReply(RequestVoteReply {
                term: state.current_term,
                vote_granted,
            }),
        }],
    ))
}

fn handle_install_snapshot<M: StateMachine>(
    state: &mut NodeState<M>,
    req: InstallSnapshotRequest,
) -> Result<(Role, Vec<Effect>)> {
    if req.term < state.current_term {
        let (last_index, _) = state.log.last_index_term();
        return Ok((
            Role::Follower,
            vec![Effect::SendMsg {
                to: req.leader_id,
                msg: PeerMsg::InstallSnapshotReply(InstallSnapshotReply {
                    term: state.current_term,
                    last_index,
                }),
            }],
        ));
    }

    state.leader_id = Some(req.leader_id);
    let snapshot = req.snapshot;
    let last_index = snapshot.meta.last_index;
    let last_term = snapshot.meta.last_term;
    let members = snapshot.meta.members.clone();

    state.machine.restore(&snapshot.machine_state)?;
    state.log.write_snapshot(snapshot)?;
    state.commit_index = state.commit_index.max(last_index);
    state.last_applied = state.last_applied.max(last_index);
    state.cluster = Cluster::new(members);
    state.cluster_index_term = (last_index, last_term);
    state.previous_cluster = None;

    debug!(
        node_id = state.id,
        last_index, last_term, "Installed snapshot"
    );

    let (our_last, _) = state.log.last_index_term();
    Ok((
        Role::Follower,
        vec![Effect::SendMsg {
            to: req.leader_id,
            msg: PeerMsg::InstallSnapshotReply(InstallSnapshotReply {
                term: state.current_term,
                last_index: our_last,
            }),
        }],
    ))
}
