//! Cohort - a Raft consensus core with a shared, fsync-batched write-ahead log.
//!
//! Cohort implements the consensus side of a replicated state machine: the
//! per-node role machine (follower / candidate / leader / await-condition),
//! the per-node log facade, and a process-wide WAL that many co-located
//! nodes write through while sharing fsync batches.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Cohort                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Node state machines: role handlers | apply loop | effects   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Log facades: WalLog / MemLog | snapshots | metadata         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Shared WAL: fsync batching | mem-tables | rollover          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Driver adapter: timers | transport | reply routing          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Node handlers are pure: each message produces a role, mutated state and
//! a list of effects; the driver (or a host-supplied equivalent) executes
//! the effects. Durability is asynchronous — appends are acknowledged by
//! `Written` notices after the WAL's next fsync batch.
//!
//! # Quick Start
//!
//! ```no_run
//! use cohort::config::CohortConfig;
//! use cohort::driver::{Driver, LoopbackTransport};
//! use cohort::log::MemLog;
//! use cohort::machine::FnMachine;
//! use cohort::node::Node;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cohort::Result<()> {
//!     let config = CohortConfig::development();
//!     let machine = FnMachine::from_fn(0u64, |_cmd: &[u8], count: &mut u64| {
//!         *count += 1;
//!         count.to_be_bytes().to_vec()
//!     });
//!     let node = Node::init(&config, Box::new(MemLog::new()), machine)?;
//!
//!     let transport = Arc::new(LoopbackTransport::new());
//!     let (driver, handle) = Driver::new(node, transport, config.timeouts.clone(), None);
//!     tokio::spawn(driver.run());
//!
//!     let reply = handle
//!         .propose(b"increment".to_vec(), cohort::types::ReplyMode::AwaitConsensus)
//!         .await?;
//!     println!("applied: {:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod driver;
pub mod log;
pub mod machine;
pub mod metrics;
pub mod node;
pub mod wal;

pub use config::CohortConfig;
pub use error::{CohortError, Result};
pub use machine::{FnMachine, StateMachine};
pub use node::{Node, NodeMsg, Role};
