//! User state machines driven by the consensus core.
//!
//! The apply loop feeds committed commands to a [`StateMachine`] in log
//! order. Queries run against current state without mutating it; snapshot
//! and restore move whole machine states across the snapshot path.

use crate::error::Result;
use crate::types::LogIndex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Trait for state machines that can be driven by the replicated log.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command, returning the reply value for the caller.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8>;

    /// Evaluate a consistent read against current state.
    fn query(&self, query: &[u8]) -> Vec<u8>;

    /// Create a snapshot of the current state.
    fn snapshot(&self) -> Vec<u8>;

    /// Restore state from a snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

type ApplyFn<S> = Box<dyn FnMut(LogIndex, &[u8], &mut S) -> Vec<u8> + Send>;
type QueryFn<S> = Box<dyn Fn(&[u8], &S) -> Vec<u8> + Send>;

/// Adapter turning plain closures into a [`StateMachine`].
///
/// Both index-free and indexed apply functions are accepted; the index-free
/// form is normalized to the indexed one at wrap time.
pub struct FnMachine<S> {
    state: S,
    apply: ApplyFn<S>,
    query: QueryFn<S>,
}

impl<S> FnMachine<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    /// Wrap an index-free apply function `(command, state) -> reply`.
    pub fn from_fn<F>(state: S, mut apply: F) -> Self
    where
        F: FnMut(&[u8], &mut S) -> Vec<u8> + Send + 'static,
    {
        Self {
            state,
            apply: Box::new(move |_index, command, state| apply(command, state)),
            query: Box::new(|_query, _state| Vec::new()),
        }
    }

    /// Wrap an indexed apply function `(index, command, state) -> reply`.
    pub fn from_indexed_fn<F>(state: S, apply: F) -> Self
    where
        F: FnMut(LogIndex, &[u8], &mut S) -> Vec<u8> + Send + 'static,
    {
        Self {
            state,
            apply: Box::new(apply),
            query: Box::new(|_query, _state| Vec::new()),
        }
    }

    /// Set the query function `(query, state) -> reply`.
    pub fn with_query<F>(mut self, query: F) -> Self
    where
        F: Fn(&[u8], &S) -> Vec<u8> + Send + 'static,
    {
        self.query = Box::new(query);
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

impl<S> StateMachine for FnMachine<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        (self.apply)(index, command, &mut self.state)
    }

    fn query(&self, query: &[u8]) -> Vec<u8> {
        (self.query)(query, &self.state)
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.state).unwrap_or_default()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        self.state = bincode::deserialize(snapshot)?;
        Ok(())
    }
}
