//! Deadlock detection and resolution scenarios.

use std::sync::atomic::Ordering;

use dlm_common::config::DlmConfig;
use dlm_core::{AgentStatus, Deadlock, LockStatus, TxnOptions};
use dlm_test::utils::{
    assert_blocked, begin, begin_with, host, oid, spec, start_cluster, start_with, wait_for_info,
    within,
};

fn deadlock(path: &str, on: u64) -> Deadlock {
    Deadlock {
        oid: oid(path),
        host: host(on),
    }
}

/// Two agents each hold what the other wants. The lower agent surrenders
/// its lock, the other proceeds, and the victim gets it back later.
#[tokio::test]
async fn test_two_agent_cycle_surrender() {
    let cluster = start_cluster(1);
    let a = begin(&cluster, 1, 1).await;
    let b = begin(&cluster, 1, 2).await;
    assert!(a.agent_id() < b.agent_id());

    assert!(a.lock(spec("x")).await.unwrap().is_ok());
    assert!(b.lock(spec("y")).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("y")).await });
    let b_reply = within(b.lock(spec("x"))).await.unwrap();
    assert!(b_reply.is_ok());
    assert!(b_reply.deadlocks().is_empty());

    // a gave x up and is queued for it again, still waiting for y.
    let info = wait_for_info(&a, |i| !i.deadlocks.is_empty()).await;
    assert_eq!(info.deadlocks, vec![deadlock("x", 1)]);
    assert!(info.held.is_empty());
    assert!(info.is_pending(host(1), &oid("x")));
    assert!(info.is_pending(host(1), &oid("y")));
    assert!(!a_wait.is_finished());

    b.end().await.unwrap();
    let a_reply = within(a_wait).await.unwrap().unwrap();
    assert!(a_reply.is_ok());
    assert_eq!(a_reply.deadlocks(), &[deadlock("x", 1)]);

    let info = a.info().await.unwrap();
    assert_eq!(info.held.len(), 2);
    assert_eq!(info.status, AgentStatus::Active);

    let result = a.await_all_locks().await.unwrap();
    assert_eq!(result.status, LockStatus::HaveAllLocks);
    assert_eq!(result.deadlocks, vec![deadlock("x", 1)]);

    let stats = cluster.stats();
    assert!(stats.deadlocks.load(Ordering::Relaxed) >= 1);
    assert_eq!(stats.surrenders.load(Ordering::Relaxed), 1);
    assert_eq!(stats.aborted.load(Ordering::Relaxed), 0);
}

/// The wait-for cycle spans two hosts and two home hosts.
#[tokio::test]
async fn test_cross_host_cycle_surrender() {
    let cluster = start_cluster(2);
    let a = begin(&cluster, 1, 1).await;
    let b = begin(&cluster, 2, 2).await;

    assert!(a.lock(spec("x")).await.unwrap().is_ok());
    assert!(b.lock(spec("y")).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("y").on_hosts([host(2)])).await });
    assert_blocked(&a_wait).await;

    let b_reply = within(b.lock(spec("x").on_hosts([host(1)]))).await.unwrap();
    assert!(b_reply.is_ok());

    b.end().await.unwrap();
    let a_reply = within(a_wait).await.unwrap().unwrap();
    assert!(a_reply.is_ok());
    assert_eq!(a_reply.deadlocks(), &[deadlock("x", 1)]);

    let snapshot = cluster.snapshot(host(1)).await.unwrap();
    assert!(snapshot.held_by(a.agent_id(), &oid("x")).is_some());
}

/// A victim that aborts answers `HaveNone` and holds nothing.
#[tokio::test]
async fn test_cycle_abort_victim() {
    let cluster = start_cluster(2);
    let a = begin_with(&cluster, 1, 1, TxnOptions::new().abort_on_deadlock(true)).await;
    let b = begin(&cluster, 2, 2).await;

    assert!(a.lock(spec("x")).await.unwrap().is_ok());
    assert!(a.lock(spec("w").read()).await.unwrap().is_ok());
    assert!(b.lock(spec("y")).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("y").on_hosts([host(2)])).await });
    let b_reply = within(b.lock(spec("x").on_hosts([host(1)]))).await.unwrap();
    assert!(b_reply.is_ok());

    let a_reply = within(a_wait).await.unwrap().unwrap();
    assert!(!a_reply.is_ok());
    assert_eq!(a_reply.deadlocks(), &[deadlock("x", 1)]);

    let info = a.info().await.unwrap();
    assert_eq!(info.status, AgentStatus::Aborted);
    assert!(info.held.is_empty());
    assert!(info.abort_on_deadlock);

    // Further calls report HaveNone until the transaction is ended.
    assert!(!a.lock(spec("z")).await.unwrap().is_ok());
    let result = a.await_all_locks().await.unwrap();
    assert_eq!(result.status, LockStatus::HaveNone);

    // The unrelated read on w was released too.
    let snapshot = cluster.snapshot(host(1)).await.unwrap();
    assert!(snapshot.entry(&oid("w")).is_none());
    assert_eq!(cluster.stats().aborted.load(Ordering::Relaxed), 1);

    a.end().await.unwrap();
}

/// The configured default applies when a transaction does not choose.
#[tokio::test]
async fn test_abort_default_from_config() {
    let config = DlmConfig::builder()
        .hosts([1])
        .abort_on_deadlock(true)
        .build()
        .unwrap();
    let cluster = start_with(config);
    let a = begin(&cluster, 1, 1).await;
    let b = begin_with(&cluster, 1, 2, TxnOptions::new().abort_on_deadlock(false)).await;
    assert!(a.info().await.unwrap().abort_on_deadlock);
    assert!(!b.info().await.unwrap().abort_on_deadlock);

    assert!(a.lock(spec("x")).await.unwrap().is_ok());
    assert!(b.lock(spec("y")).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("y")).await });
    assert!(within(b.lock(spec("x"))).await.unwrap().is_ok());
    assert!(!within(a_wait).await.unwrap().unwrap().is_ok());
}

/// Three agents wait in a ring. Only the lowest gives anything up.
#[tokio::test]
async fn test_three_agent_cycle() {
    let cluster = start_cluster(1);
    let a = begin(&cluster, 1, 1).await;
    let b = begin(&cluster, 1, 2).await;
    let c = begin(&cluster, 1, 3).await;

    assert!(a.lock(spec("db/x")).await.unwrap().is_ok());
    assert!(b.lock(spec("db/y")).await.unwrap().is_ok());
    assert!(c.lock(spec("db/z")).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("db/y")).await });
    let b2 = b.clone();
    let b_wait = tokio::spawn(async move { b2.lock(spec("db/z")).await });
    assert_blocked(&a_wait).await;

    // c closes the ring; a surrenders db/x to it.
    let c_reply = within(c.lock(spec("db/x"))).await.unwrap();
    assert!(c_reply.is_ok());
    assert!(c_reply.deadlocks().is_empty());

    c.end().await.unwrap();
    let b_reply = within(b_wait).await.unwrap().unwrap();
    assert!(b_reply.is_ok());
    assert!(b_reply.deadlocks().is_empty());

    b.end().await.unwrap();
    let a_reply = within(a_wait).await.unwrap().unwrap();
    assert!(a_reply.is_ok());
    assert_eq!(a_reply.deadlocks(), &[deadlock("db/x", 1)]);
}

/// One victim closes two cycles at once. Both are broken, the second after
/// the victim finishes surrendering for the first.
#[tokio::test]
async fn test_victim_in_two_cycles() {
    let cluster = start_cluster(1);
    let v = begin(&cluster, 1, 1).await;
    let p1 = begin(&cluster, 1, 2).await;
    let p2 = begin(&cluster, 1, 3).await;

    assert!(v.lock(spec("x")).await.unwrap().is_ok());
    assert!(v.lock(spec("y")).await.unwrap().is_ok());
    assert!(p1.lock(spec("p")).await.unwrap().is_ok());
    assert!(p2.lock(spec("q")).await.unwrap().is_ok());

    let w1 = p1.clone();
    let p1_wait = tokio::spawn(async move { w1.lock(spec("x")).await });
    let w2 = p2.clone();
    let p2_wait = tokio::spawn(async move { w2.lock(spec("y")).await });
    assert_blocked(&p1_wait).await;
    assert_blocked(&p2_wait).await;

    v.lock_objects(vec![spec("p"), spec("q")]).unwrap();

    assert!(within(p1_wait).await.unwrap().unwrap().is_ok());
    assert!(within(p2_wait).await.unwrap().unwrap().is_ok());

    let mut given_up = wait_for_info(&v, |i| i.deadlocks.len() == 2).await.deadlocks;
    given_up.sort_by(|a, b| a.oid.cmp(&b.oid));
    assert_eq!(given_up, vec![deadlock("x", 1), deadlock("y", 1)]);

    p1.end().await.unwrap();
    p2.end().await.unwrap();
    let result = within(v.await_all_locks()).await.unwrap();
    assert_eq!(result.status, LockStatus::HaveAllLocks);
    assert_eq!(v.info().await.unwrap().held.len(), 4);
    assert_eq!(cluster.stats().surrenders.load(Ordering::Relaxed), 2);
}

/// The waiter blocks on a descendant hold and on a queued request of the
/// victim. Both are given up.
#[tokio::test]
async fn test_prefix_cycle() {
    let cluster = start_cluster(1);
    let a = begin(&cluster, 1, 1).await;
    let b = begin(&cluster, 1, 2).await;

    assert!(a.lock(spec("db/t1").read()).await.unwrap().is_ok());
    assert!(b.lock(spec("db/t2/k1")).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("db/t2")).await });
    assert_blocked(&a_wait).await;

    // b wants the whole database, which a's read on db/t1 blocks.
    assert!(within(b.lock(spec("db"))).await.unwrap().is_ok());

    b.end().await.unwrap();
    let a_reply = within(a_wait).await.unwrap().unwrap();
    assert!(a_reply.is_ok());
    assert_eq!(
        a_reply.deadlocks(),
        &[deadlock("db/t1", 1), deadlock("db/t2", 1)]
    );
}

/// Two readers upgrading the same object do not deadlock: the first
/// upgrade gives up its read and queues, the second then queues behind it.
#[tokio::test]
async fn test_competing_upgrades() {
    let cluster = start_cluster(1);
    let a = begin(&cluster, 1, 1).await;
    let b = begin(&cluster, 1, 2).await;

    assert!(a.lock(spec("x").read()).await.unwrap().is_ok());
    assert!(b.lock(spec("x").read()).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("x")).await });
    assert_blocked(&a_wait).await;

    // b's upgrade drops its read, which lets a's queued upgrade through.
    let b2 = b.clone();
    let b_wait = tokio::spawn(async move { b2.lock(spec("x")).await });
    assert!(within(a_wait).await.unwrap().unwrap().is_ok());
    assert_blocked(&b_wait).await;

    a.end().await.unwrap();
    assert!(within(b_wait).await.unwrap().unwrap().is_ok());
    assert_eq!(cluster.stats().deadlocks.load(Ordering::Relaxed), 0);
}

/// With detection off a cycle persists until a transaction ends.
#[tokio::test]
async fn test_detection_disabled() {
    let config = DlmConfig::builder()
        .hosts([1])
        .deadlock_detection(false)
        .build()
        .unwrap();
    let cluster = start_with(config);
    let a = begin(&cluster, 1, 1).await;
    let b = begin(&cluster, 1, 2).await;

    assert!(a.lock(spec("x")).await.unwrap().is_ok());
    assert!(b.lock(spec("y")).await.unwrap().is_ok());

    let a2 = a.clone();
    let a_wait = tokio::spawn(async move { a2.lock(spec("y")).await });
    let b2 = b.clone();
    let b_wait = tokio::spawn(async move { b2.lock(spec("x")).await });
    assert_blocked(&a_wait).await;
    assert_blocked(&b_wait).await;
    assert_eq!(cluster.stats().deadlocks.load(Ordering::Relaxed), 0);

    a.end().await.unwrap();
    assert!(!within(a_wait).await.unwrap().unwrap().is_ok());
    assert!(within(b_wait).await.unwrap().unwrap().is_ok());
}
