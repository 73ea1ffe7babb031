//! Concurrency policies at the admission gate

mod common;

use common::{harness, holding};
use mechaflow::flow::{ConcurrencyPolicy, ConflictPolicy, LockScope};
use mechaflow::history::{ExecutionStatus, Trigger};
use mechaflow::runtime::ExecutionContext;
use serde_json::json;
use std::time::Duration;

fn policy(on_conflict: ConflictPolicy, queue_timeout_ms: Option<u64>) -> ConcurrencyPolicy {
    ConcurrencyPolicy {
        max_concurrent: 1,
        on_conflict,
        lock_scope: LockScope::Global,
        queue_timeout_ms,
    }
}

#[tokio::test]
async fn reject_refuses_second_run_while_first_is_paused() {
    let h = harness().await;
    let mut flow = holding("exclusive");
    flow.concurrency = policy(ConflictPolicy::Reject, None);
    h.service.create_flow(flow).await.unwrap();

    let first = h.engine.execute("exclusive", ExecutionContext::manual()).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Paused);

    let refused = h.service.trigger_flow("exclusive", ExecutionContext::manual()).await;
    assert!(!refused.success);
    assert!(refused.execution_id.is_none());
    assert_eq!(refused.error.unwrap().code, "concurrent_execution_limit");

    // Finishing the holder frees the lock
    h.engine.resume(&first.id, None, json!({})).await.unwrap();
    let second = h.engine.execute("exclusive", ExecutionContext::manual()).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Paused);
}

#[tokio::test]
async fn queued_run_times_out() {
    let h = harness().await;
    let mut flow = holding("queued");
    flow.concurrency = policy(ConflictPolicy::Queue, Some(50));
    h.service.create_flow(flow).await.unwrap();

    h.engine.execute("queued", ExecutionContext::manual()).await.unwrap();
    let err = h
        .engine
        .execute("queued", ExecutionContext::manual())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "concurrent_execution_limit");

    let snapshot = h.engine.concurrency_snapshot().await;
    assert_eq!(snapshot["queued"].queued, 0);
}

#[tokio::test]
async fn queued_run_is_admitted_when_holder_is_cancelled() {
    let h = harness().await;
    let mut flow = holding("handoff");
    flow.concurrency = policy(ConflictPolicy::Queue, None);
    h.service.create_flow(flow).await.unwrap();

    let first = h.engine.execute("handoff", ExecutionContext::manual()).await.unwrap();

    let engine = h.engine.clone();
    let waiter = tokio::spawn(async move { engine.execute("handoff", ExecutionContext::manual()).await });
    // Let the second run reach the queue
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    h.engine.cancel(&first.id).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.status, ExecutionStatus::Paused);
    assert_eq!(h.engine.concurrency_snapshot().await["handoff"].in_flight, vec![second.id]);
}

#[tokio::test]
async fn cancel_existing_replaces_the_running_holder() {
    let h = harness().await;
    let mut flow = holding("latest_wins");
    flow.concurrency = policy(ConflictPolicy::CancelExisting, None);
    h.service.create_flow(flow).await.unwrap();

    let first = h.engine.execute("latest_wins", ExecutionContext::manual()).await.unwrap();
    let second = h.engine.execute("latest_wins", ExecutionContext::manual()).await.unwrap();

    assert_eq!(second.status, ExecutionStatus::Paused);
    let first = h.engine.get_run(&first.id).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Cancelled);
    assert!(h.engine.checkpoints().load(&first.id).await.unwrap().is_none());
}

#[tokio::test]
async fn per_record_scope_keys_locks_by_record() {
    let h = harness().await;
    let mut flow = holding("per_record");
    flow.concurrency = ConcurrencyPolicy {
        lock_scope: LockScope::PerRecord,
        ..policy(ConflictPolicy::Reject, None)
    };
    h.service.create_flow(flow).await.unwrap();

    let order = |id: &str| ExecutionContext::new(Trigger::manual().with_record("order", id));
    let a = h.engine.execute("per_record", order("A-1")).await.unwrap();
    let b = h.engine.execute("per_record", order("B-2")).await.unwrap();
    assert_eq!(a.status, ExecutionStatus::Paused);
    assert_eq!(b.status, ExecutionStatus::Paused);
    assert_ne!(a.lock_key, b.lock_key);

    let err = h.engine.execute("per_record", order("A-1")).await.unwrap_err();
    assert_eq!(err.code(), "concurrent_execution_limit");
}

#[tokio::test]
async fn simultaneous_cancel_existing_newcomers_do_not_strand_each_other() {
    let h = harness().await;
    let mut flow = holding("newest_wins");
    flow.concurrency = policy(ConflictPolicy::CancelExisting, None);
    h.service.create_flow(flow).await.unwrap();
    let first = h.engine.execute("newest_wins", ExecutionContext::manual()).await.unwrap();

    let newcomers: Vec<_> = (0..2)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.execute("newest_wins", ExecutionContext::manual()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.engine.get_run(&first.id).await.unwrap().status, ExecutionStatus::Cancelled);
    let holders = h.engine.concurrency_snapshot().await["newest_wins"].in_flight.clone();
    assert_eq!(holders.len(), 1);
    assert_eq!(h.engine.get_run(&holders[0]).await.unwrap().status, ExecutionStatus::Paused);

    // Ending the current holder lets whoever is still in line through
    h.engine.cancel(&holders[0]).await.unwrap();
    for newcomer in newcomers {
        let log = tokio::time::timeout(Duration::from_secs(5), newcomer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(log.status, ExecutionStatus::Paused);
    }
    let snapshot = h.engine.concurrency_snapshot().await;
    assert!(snapshot.get("newest_wins").map_or(0, |slot| slot.in_flight.len()) <= 1);
}
