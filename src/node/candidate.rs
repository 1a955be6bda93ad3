//! Candidate role handlers.
//!
//! A candidate bumps its term, persists the self-vote, and broadcasts
//! RequestVote. Reaching `floor(|cluster| / 2) + 1` grants wins the
//! election; an AppendEntries from a legitimate leader (term not behind
//! ours) sends the candidate back to follower with the message re-handled
//! there.

use super::message::{
    Effect, NodeMsg, PeerMsg, ReplyValue, RequestVoteReply, RequestVoteRequest,
};
use super::{follower, leader, NodeState, Role};
use crate::error::Result;
use crate::machine::StateMachine;
use tracing::{debug, info, warn};

/// Start (or restart) an election.
pub(super) fn start_election<M: StateMachine>(
    state: &mut NodeState<M>,
) -> Result<(Role, Vec<Effect>)> {
    state.current_term += 1;
    state.voted_for = Some(state.id);
    state.persist_meta()?;
    state.leader_id = None;
    state.condition = None;
    state.votes.clear();
    state.votes.insert(state.id);

    info!(
        node_id = state.id,
        term = state.current_term,
        "Starting election"
    );

    let (last_log_index, last_log_term) = state.log.last_index_term();
    let requests: Vec<_> = state
        .cluster
        .peer_ids(state.id)
        .into_iter()
        .map(|peer| {
            (
                peer,
                RequestVoteRequest {
                    term: state.current_term,
                    candidate_id: state.id,
                    last_log_index,
                    last_log_term,
                },
            )
        })
        .collect();

    let effects = vec![Effect::SendVoteRequests(requests)];

    // A single-node cluster elects itself on the spot.
    if state.votes.len() >= state.cluster.quorum_size() {
        return leader::become_leader(state, effects);
    }
    Ok((Role::Candidate, effects))
}

pub(super) fn handle<M: StateMachine>(
    state: &mut NodeState<M>,
    msg: NodeMsg,
) -> Result<(Role, Vec<Effect>)> {
    match msg {
        NodeMsg::RequestVoteReply { from, reply } => {
            if reply.term < state.current_term || !reply.vote_granted {
                return Ok((Role::Candidate, Vec::new()));
            }
            if !state.cluster.contains(from) {
                warn!(node_id = state.id, from, "Vote from unknown peer, ignoring");
                return Ok((Role::Candidate, Vec::new()));
            }
            state.votes.insert(from);
            debug!(
                node_id = state.id,
                voter = from,
                votes = state.votes.len(),
                "Received vote"
            );
            if state.votes.len() >= state.cluster.quorum_size() {
                return leader::become_leader(state, Vec::new());
            }
            Ok((Role::Candidate, Vec::new()))
        }

        NodeMsg::AppendEntries(ref req) => {
            if req.term < state.current_term {
                let (last_index, last_term) = state.log.last_index_term();
                return Ok((
                    Role::Candidate,
                    vec![Effect::SendMsg {
                        to: req.leader_id,
                        msg: PeerMsg::AppendEntriesReply(super::message::AppendEntriesReply {
                            term: state.current_term,
                            success: false,
                            next_index: last_index + 1,
                            last_index,
                            last_term,
                        }),
                    }],
                ));
            }
            // A leader exists for this term; stand down and handle the
            // entries as a follower.
            state.votes.clear();
            follower::handle(state, msg)
        }

        NodeMsg::InstallSnapshot(ref req) if req.term >= state.current_term => {
            state.votes.clear();
            follower::handle(state, msg)
        }

        NodeMsg::RequestVote(req) => {
            // Same-term rival candidate; our vote went to ourselves.
            Ok((
                Role::Candidate,
                vec![Effect::SendMsg {
                    to: req.candidate_id,
                    msg: PeerMsg::RequestVoteReply(RequestVoteReply {
                        term: state.current_term,
                        vote_granted: false,
                    }),
                }],
            ))
        }

        NodeMsg::ElectionTimeout => start_election(state),

        NodeMsg::Command(cmd) => {
            let mut effects = Vec::new();
            if let Some(caller) = cmd.caller() {
                effects.push(Effect::Reply {
                    to: caller,
                    value: ReplyValue::NotLeader {
                        term: state.current_term,
                        leader: None,
                    },
                });
            }
            Ok((Role::Candidate, effects))
        }

        NodeMsg::Written { from, to, term } => {
            // Acknowledgements for writes from our follower days.
            state.log.handle_written(from, to, term);
            let (last_written, _) = state.log.last_written();
            let effects = state.apply_to(state.commit_index.min(last_written))?;
            Ok((Role::Candidate, super::filter_follower_effects(effects)))
        }

        NodeMsg::ResendWrite { from } => {
            state.log.handle_resend(from)?;
            Ok((Role::Candidate, Vec::new()))
        }

        other => {
            debug!(node_id = state.id, msg = ?other, "Candidate ignoring message");
            Ok((Role::Candidate, Vec::new()))
        }
    }
}
