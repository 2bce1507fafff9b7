//! Helpers shared by the integration tests.

use std::future::Future;
use std::time::Duration;

use dlm_common::config::DlmConfig;
use dlm_common::types::{ClientId, HostId, Oid};
use dlm_core::{AgentHandle, AgentInfo, Cluster, LockSpec, TxnOptions};
use tokio::time::timeout;

/// Upper bound for anything that is expected to complete.
pub const WAIT: Duration = Duration::from_secs(5);

/// How long to watch something that is expected to stay blocked.
pub const SETTLE: Duration = Duration::from_millis(100);

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Starts a cluster of hosts `1..=count` with default settings.
pub fn start_cluster(count: u64) -> Cluster {
    start_with(DlmConfig::with_hosts(1..=count))
}

/// Starts a cluster from `config`.
pub fn start_with(config: DlmConfig) -> Cluster {
    init_tracing();
    Cluster::start(config).expect("Failed to start cluster")
}

/// Shorthand for `HostId::new`.
pub fn host(id: u64) -> HostId {
    HostId::new(id)
}

/// Parses a `/`-separated OID.
pub fn oid(path: &str) -> Oid {
    Oid::parse(path).expect("Invalid OID")
}

/// A write request on `path` at the agent's home host.
pub fn spec(path: &str) -> LockSpec {
    LockSpec::parse(path).expect("Invalid OID")
}

/// Begins an empty transaction for client `id` homed on `home`.
pub async fn begin(cluster: &Cluster, home: u64, id: u64) -> AgentHandle {
    begin_with(cluster, home, id, TxnOptions::new()).await
}

/// Begins an empty transaction with explicit options.
pub async fn begin_with(
    cluster: &Cluster,
    home: u64,
    id: u64,
    options: TxnOptions,
) -> AgentHandle {
    let manager = cluster.node(host(home)).expect("Unknown host");
    let (txn, result) = manager
        .begin_transaction(ClientId::new(id), Vec::new(), options)
        .await
        .expect("Failed to begin transaction");
    assert!(result.have_all_locks());
    txn
}

/// Awaits `fut`, failing the test if it takes longer than [`WAIT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    timeout(WAIT, fut)
        .await
        .expect("Operation did not complete in time")
}

/// Polls the agent until `pred` holds on its info, or fails after [`WAIT`].
pub async fn wait_for_info<P>(txn: &AgentHandle, mut pred: P) -> AgentInfo
where
    P: FnMut(&AgentInfo) -> bool,
{
    within(async {
        loop {
            let info = txn.info().await.expect("Agent gone");
            if pred(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Asserts that `handle` is still running after [`SETTLE`].
pub async fn assert_blocked<T>(handle: &tokio::task::JoinHandle<T>) {
    tokio::time::sleep(SETTLE).await;
    assert!(!handle.is_finished(), "Expected the call to stay blocked");
}
