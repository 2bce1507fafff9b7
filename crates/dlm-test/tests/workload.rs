//! Randomized workloads checking mutual exclusion and cleanup.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dlm_common::config::DlmConfig;
use dlm_test::utils::{start_cluster, start_with};
use dlm_test::workload::Workload;
use tokio::time::timeout;

const WORKLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_workload_surrender() {
    let cluster = Arc::new(start_cluster(3));
    let workload = Workload {
        seed: 42,
        ..Workload::default()
    };

    let report = timeout(WORKLOAD_TIMEOUT, workload.run(Arc::clone(&cluster)))
        .await
        .expect("Workload stalled")
        .unwrap();

    assert_eq!(report.violations, 0);
    assert_eq!(report.leftover_entries, 0);
    assert_eq!(report.aborted, 0);
    assert_eq!(report.completed, workload.txns);

    let stats = cluster.stats();
    assert_eq!(stats.started.load(Ordering::Relaxed), workload.txns as u64);
    assert_eq!(stats.active.load(Ordering::Relaxed), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_workload_abort() {
    let config = DlmConfig::builder()
        .hosts([1, 2])
        .abort_on_deadlock(true)
        .build()
        .unwrap();
    let cluster = Arc::new(start_with(config));
    let workload = Workload {
        seed: 7,
        txns: 60,
        write_ratio: 0.7,
        ..Workload::default()
    };

    let report = timeout(WORKLOAD_TIMEOUT, workload.run(Arc::clone(&cluster)))
        .await
        .expect("Workload stalled")
        .unwrap();

    assert_eq!(report.violations, 0);
    assert_eq!(report.leftover_entries, 0);
    assert_eq!(report.completed + report.aborted, workload.txns);
    assert_eq!(
        cluster.stats().aborted.load(Ordering::Relaxed),
        report.aborted as u64
    );
}
