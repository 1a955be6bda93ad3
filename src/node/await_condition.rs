//! Await-condition role.
//!
//! A node suspends normal processing in two situations: its log has a gap
//! the leader must walk back to (catch-up), or the WAL sink died under it.
//! While suspended, only the condition predicate examines incoming
//! messages; a message that satisfies it is re-handled as a follower.
//! RequestVote always falls back to follower so elections cannot starve,
//! an election timeout still starts a campaign, and the await-condition
//! timeout reverts to follower unconditionally.

use super::message::{Effect, NodeMsg};
use super::{candidate, follower, NodeState, Role};
use crate::error::Result;
use crate::machine::StateMachine;
use tracing::debug;

/// Predicate deciding when the node may resume as follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitCondition {
    /// Waiting for an AppendEntries whose prev entry we hold, or a
    /// snapshot covering the gap.
    CatchUp,
    /// Waiting for the host to bring the WAL back.
    WalRecovered,
}

impl AwaitCondition {
    fn satisfied<M: StateMachine>(&self, state: &NodeState<M>, msg: &NodeMsg) -> bool {
        match self {
            AwaitCondition::CatchUp => match msg {
                NodeMsg::AppendEntries(req) => {
                    req.prev_log_index == 0
                        || state.log.fetch_term(req.prev_log_index) == Some(req.prev_log_term)
                        || req.prev_log_index <= state.log.snapshot_index_term().0
                }
                NodeMsg::InstallSnapshot(_) => true,
                _ => false,
            },
            AwaitCondition::WalRecovered => {
                matches!(msg, NodeMsg::WalUp | NodeMsg::InstallSnapshot(_))
            }
        }
    }
}

pub(super) fn handle<M: StateMachine>(
    state: &mut NodeState<M>,
    msg: NodeMsg,
) -> Result<(Role, Vec<Effect>)> {
    match msg {
        // Never starve elections while suspended.
        NodeMsg::RequestVote(_) => {
            state.condition = None;
            follower::handle(state, msg)
        }
        NodeMsg::ElectionTimeout => {
            state.condition = None;
            candidate::start_election(state)
        }
        NodeMsg::AwaitConditionTimeout => {
            debug!(node_id = state.id, "Await-condition timed out, reverting to follower");
            state.condition = None;
            Ok((Role::Follower, Vec::new()))
        }

        // WAL traffic is log-internal bookkeeping, not peer input; keep the
        // watermark honest while suspended.
        NodeMsg::Written { from, to, term } => {
            state.log.handle_written(from, to, term);
            Ok((Role::AwaitCondition, Vec::new()))
        }
        NodeMsg::ResendWrite { from } => {
            state.log.handle_resend(from)?;
            Ok((Role::AwaitCondition, Vec::new()))
        }

        other => {
            let condition = match state.condition {
                Some(condition) => condition,
                None => {
                    // No predicate armed; nothing holds us here.
                    state.condition = None;
                    return follower::handle(state, other);
                }
            };
            if condition.satisfied(state, &other) {
                debug!(node_id = state.id, "Await condition satisfied, resuming as follower");
                state.condition = None;
                if matches!(other, NodeMsg::WalUp) {
                    return Ok((Role::Follower, Vec::new()));
                }
                follower::handle(state, other)
            } else {
                debug!(node_id = state.id, msg = ?other, "Suspended, dropping message");
                Ok((Role::AwaitCondition, Vec::new()))
            }
        }
    }
}
