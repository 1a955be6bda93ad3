//! Driven-cluster integration tests.
//!
//! Spin up three nodes under the driver with the in-process transport and
//! let real timers run the election, replication and apply paths.

use cohort::config::CohortConfig;
use cohort::driver::{Driver, LoopbackTransport};
use cohort::log::MemLog;
use cohort::machine::FnMachine;
use cohort::node::message::ReplyValue;
use cohort::node::Node;
use cohort::types::{NodeId, ReplyMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Capture driver and node tracing in test output; `RUST_LOG` controls
/// verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn counter_machine() -> FnMachine<i64> {
    FnMachine::from_fn(0i64, |command: &[u8], state: &mut i64| {
        if command.first() == Some(&b'+') {
            *state += 1;
        }
        state.to_be_bytes().to_vec()
    })
    .with_query(|_query, state| state.to_be_bytes().to_vec())
}

fn cluster_config(id: NodeId, members: &[NodeId]) -> CohortConfig {
    let mut config = CohortConfig::development();
    config.node.id = id;
    config.node.initial_members = members.to_vec();
    config.timeouts.broadcast_interval = Duration::from_millis(20);
    config
}

async fn start_cluster(
    members: &[NodeId],
) -> (Arc<LoopbackTransport>, Vec<cohort::driver::ClientHandle>) {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    let mut handles = Vec::new();
    for &id in members {
        let config = cluster_config(id, members);
        let node = Node::init(&config, Box::new(MemLog::new()), counter_machine()).unwrap();
        let (driver, handle) =
            Driver::new(node, transport.clone(), config.timeouts.clone(), None);
        transport.register(id, driver.mailbox());
        tokio::spawn(driver.run());
        handles.push(handle);
    }
    (transport, handles)
}

/// Keep proposing through every handle until one (the leader's) applies.
async fn propose_until_applied(
    handles: &[cohort::driver::ClientHandle],
    payload: &[u8],
) -> ReplyValue {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "no leader applied the command in time");
        for handle in handles {
            // Long per-attempt timeout: a proposal that reached a leader
            // must be allowed to finish, or a retry would double-apply.
            let attempt = timeout(
                Duration::from_secs(2),
                handle.propose(payload.to_vec(), ReplyMode::AwaitConsensus),
            )
            .await;
            if let Ok(Ok(reply @ ReplyValue::Applied { .. })) = attempt {
                return reply;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_elects_and_applies_commands() {
    let (_transport, handles) = start_cluster(&[1, 2, 3]).await;

    let reply = propose_until_applied(&handles, b"+").await;
    match reply {
        ReplyValue::Applied { result, .. } => {
            assert_eq!(result, 1i64.to_be_bytes().to_vec());
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    // A second command sees the first one's effect.
    let reply = propose_until_applied(&handles, b"+").await;
    match reply {
        ReplyValue::Applied { result, .. } => {
            assert_eq!(result, 2i64.to_be_bytes().to_vec());
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_serves_consistent_queries() {
    let (_transport, handles) = start_cluster(&[1, 2, 3]).await;

    propose_until_applied(&handles, b"+").await;

    // The query goes through the log, so it reflects the applied command.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "query never applied");
        for handle in &handles {
            let attempt = timeout(Duration::from_secs(2), handle.query(b"count".to_vec())).await;
            if let Ok(Ok(ReplyValue::Applied { result, .. })) = attempt {
                assert_eq!(result, 1i64.to_be_bytes().to_vec());
                return;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_extends_to_fourth_node() {
    let members = [1, 2, 3];
    let (transport, handles) = start_cluster(&members).await;

    propose_until_applied(&handles, b"+").await;

    // Start the fourth node knowing the full target membership. Its lazy
    // election timer keeps it from deposing the sitting leader before the
    // membership change commits.
    let mut config = cluster_config(4, &[1, 2, 3, 4]);
    config.timeouts.broadcast_interval = Duration::from_millis(400);
    let node = Node::init(&config, Box::new(MemLog::new()), counter_machine()).unwrap();
    let (driver, handle4) = Driver::new(node, transport.clone(), config.timeouts.clone(), None);
    transport.register(4, driver.mailbox());
    tokio::spawn(driver.run());

    // Ask the cluster to adopt it.
    let deadline = Instant::now() + Duration::from_secs(10);
    'outer: loop {
        assert!(Instant::now() < deadline, "membership change never applied");
        for handle in &handles {
            let attempt = timeout(
                Duration::from_secs(2),
                handle.change_membership(vec![1, 2, 3, 4]),
            )
            .await;
            if let Ok(Ok(ReplyValue::Applied { .. })) = attempt {
                break 'outer;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }

    // The new node eventually receives replicated state; a command
    // proposed through any member still applies.
    let mut handles = handles;
    handles.push(handle4);
    let reply = propose_until_applied(&handles, b"+").await;
    assert!(matches!(reply, ReplyValue::Applied { .. }));
}
