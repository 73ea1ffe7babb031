//! End-to-end run behaviour: suspension, joins, retries and boundary timers

mod common;

use async_trait::async_trait;
use common::{approve_order, definition, harness, harness_with};
use mechaflow::config::{EngineConfig, SchedulerConfig};
use mechaflow::error::ActionError;
use mechaflow::flow::{Edge, Node, NodeKind};
use mechaflow::history::{CheckpointReason, ExecutionStatus, Severity, StepStatus};
use mechaflow::runtime::collaborators::{HttpRequest, HttpResponse, HttpTransport};
use mechaflow::runtime::{Collaborators, ExecutionContext};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn small_order_is_approved_automatically() {
    let h = harness().await;
    h.service.create_flow(approve_order()).await.unwrap();

    let log = h
        .engine
        .execute("approve_order", ExecutionContext::manual().with_param("amount", json!(500)))
        .await
        .unwrap();

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.variables["approved"], true);
    assert_eq!(log.steps_for("await_approval").count(), 0);
    assert!(log.completed_at.is_some());
}

#[tokio::test]
async fn large_order_waits_for_approval_then_completes() {
    let h = harness().await;
    h.service.create_flow(approve_order()).await.unwrap();

    let paused = h
        .engine
        .execute("approve_order", ExecutionContext::manual().with_param("amount", json!(5000)))
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    let checkpoint = h.engine.checkpoints().load(&paused.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.reason, CheckpointReason::Approval);
    assert!(checkpoint.is_live());

    let done = h
        .service
        .resume_run(&paused.id, Some("await_approval"), json!({ "approved": true, "approver": "ops" }))
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.variables["approver"], "ops");
    assert_eq!(done.variables["amount"], 5000);
    // Steps before the suspension are never logged twice
    for node in ["start", "check_amount", "await_approval", "end"] {
        assert_eq!(done.steps_for(node).count(), 1, "node {node}");
    }
    assert!(h.engine.checkpoints().load(&paused.id).await.unwrap().is_none());
    assert!(h.engine.concurrency_snapshot().await.is_empty());
}

#[tokio::test]
async fn join_fires_once_after_resumed_branch_arrives() {
    let h = harness().await;
    let flow = definition(
        "fan_out",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("split", NodeKind::ParallelGateway),
            Node::new("quick", NodeKind::Assignment).with_params(json!({
                "assignments": [{ "variable": "quick", "value": 1 }]
            })),
            Node::new("slow", NodeKind::Wait),
            Node::new("merge", NodeKind::JoinGateway),
            Node::new("end", NodeKind::End),
        ],
        vec![
            Edge::new("start", "split"),
            Edge::new("split", "quick"),
            Edge::new("split", "slow"),
            Edge::new("quick", "merge"),
            Edge::new("slow", "merge"),
            Edge::new("merge", "end"),
        ],
    );
    h.service.create_flow(flow).await.unwrap();

    let paused = h.engine.execute("fan_out", ExecutionContext::manual()).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.steps_for("merge").count(), 0);
    let checkpoint = h.engine.checkpoints().load(&paused.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.reason, CheckpointReason::ParallelJoin);
    assert_eq!(checkpoint.join_arrivals.get("merge"), Some(&1));

    let done = h.engine.resume(&paused.id, None, json!({ "slow": 2 })).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.steps_for("merge").count(), 1);
    assert_eq!(done.steps_for("end").count(), 1);
    assert_eq!(done.steps_for("quick").count(), 1);
    assert_eq!(done.variables["quick"], 1);
    assert_eq!(done.variables["slow"], 2);
}

/// Returns 503 until the configured number of failures has been served
struct FlakyTransport {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl HttpTransport for FlakyTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let status = if call < self.failures { 503 } else { 200 };
        Ok(HttpResponse {
            status,
            headers: Default::default(),
            body: json!({ "call": call }),
        })
    }
}

#[tokio::test]
async fn http_node_retries_transient_failures() {
    let transport = Arc::new(FlakyTransport {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let services = Collaborators::default().with_http(transport.clone());
    let h = harness_with(EngineConfig::default(), SchedulerConfig::default(), services).await;

    let flow = definition(
        "notify",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("call", NodeKind::HttpRequest).with_params(json!({
                "url": "https://hooks.example.test/notify",
                "method": "POST",
                "maxRetries": 2,
                "outputVariable": "response"
            })),
            Node::new("end", NodeKind::End),
        ],
        vec![Edge::new("start", "call"), Edge::new("call", "end")],
    );
    h.service.create_flow(flow).await.unwrap();

    let log = h.engine.execute("notify", ExecutionContext::manual()).await.unwrap();
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    assert_eq!(log.variables["response"]["status"], 200);

    let attempts: Vec<_> = log.steps_for("call").map(|s| (s.status, s.retry_attempt)).collect();
    assert_eq!(
        attempts,
        vec![
            (StepStatus::Failure, Some(0)),
            (StepStatus::Failure, Some(1)),
            (StepStatus::Success, Some(2)),
        ]
    );
    let retried: Vec<_> = log.errors.iter().filter(|e| e.code == "http_5xx").collect();
    assert_eq!(retried.len(), 2);
    assert!(retried.iter().all(|e| e.retryable && e.resolved_at.is_some()));
}

#[tokio::test]
async fn http_node_fails_run_once_retries_are_exhausted() {
    let transport = Arc::new(FlakyTransport {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let services = Collaborators::default().with_http(transport.clone());
    let h = harness_with(EngineConfig::default(), SchedulerConfig::default(), services).await;

    let flow = definition(
        "notify",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("call", NodeKind::HttpRequest).with_params(json!({
                "url": "https://hooks.example.test/notify",
                "maxRetries": 1
            })),
            Node::new("end", NodeKind::End),
        ],
        vec![Edge::new("start", "call"), Edge::new("call", "end")],
    );
    h.service.create_flow(flow).await.unwrap();

    let log = h.engine.execute("notify", ExecutionContext::manual()).await.unwrap();
    assert_eq!(log.status, ExecutionStatus::Failed);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(log.steps_for("end").count(), 0);
    assert!(log
        .errors
        .iter()
        .any(|e| e.code == "http_5xx" && e.severity == Severity::Critical && e.resolved_at.is_none()));
}

/// Never answers within a test's lifetime
struct HangingTransport;

#[async_trait]
impl HttpTransport for HangingTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ActionError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(ActionError::retryable("http_timeout", "gave up"))
    }
}

#[tokio::test]
async fn boundary_timer_preempts_slow_activity() {
    let services = Collaborators::default().with_http(Arc::new(HangingTransport));
    let h = harness_with(EngineConfig::default(), SchedulerConfig::default(), services).await;

    let flow = definition(
        "escalation",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("call", NodeKind::HttpRequest).with_params(json!({ "url": "https://slow.example.test" })),
            Node::new("deadline", NodeKind::BoundaryEvent).with_params(json!({
                "attachedTo": "call",
                "timerMs": 50
            })),
            Node::new("done", NodeKind::End),
            Node::new("escalated", NodeKind::End),
        ],
        vec![
            Edge::new("start", "call"),
            Edge::new("call", "done"),
            Edge::new("deadline", "escalated"),
        ],
    );
    h.service.create_flow(flow).await.unwrap();

    let log = tokio::time::timeout(
        Duration::from_secs(5),
        h.engine.execute("escalation", ExecutionContext::manual()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(log.status, ExecutionStatus::Completed);
    let call = log.steps_for("call").next().unwrap();
    assert_eq!(call.status, StepStatus::Skipped);
    assert_eq!(call.error.as_ref().unwrap().code, "boundary_event_fired");
    assert_eq!(log.steps_for("deadline").count(), 1);
    assert_eq!(log.steps_for("escalated").count(), 1);
    assert_eq!(log.steps_for("done").count(), 0);
}

#[tokio::test]
async fn timer_wait_resumes_when_due() {
    let h = harness().await;
    let flow = definition(
        "cooldown",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("sleep", NodeKind::Wait).with_params(json!({ "durationMs": 60000 })),
            Node::new("end", NodeKind::End),
        ],
        vec![Edge::new("start", "sleep"), Edge::new("sleep", "end")],
    );
    h.service.create_flow(flow).await.unwrap();

    let paused = h.engine.execute("cooldown", ExecutionContext::manual()).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    let resume_at = h.engine.checkpoints().load(&paused.id).await.unwrap().unwrap().resume_at.unwrap();

    // Nothing is due yet
    assert_eq!(h.engine.fire_due_timers(chrono::Utc::now()).await.unwrap(), 0);

    let fired = h
        .engine
        .fire_due_timers(resume_at + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(fired, 1);

    let done = h.engine.get_run(&paused.id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.steps_for("sleep").count(), 1);
    let sleep = done.steps_for("sleep").next().unwrap();
    assert!(sleep.output.as_ref().unwrap().get("resumedAt").is_some());
}

#[tokio::test]
async fn boundary_timer_beats_late_approval_on_parked_host() {
    let h = harness().await;
    let flow = definition(
        "sla",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("approve", NodeKind::Wait).with_params(json!({ "reason": "approval" })),
            Node::new("sla_breach", NodeKind::BoundaryEvent).with_params(json!({
                "attachedTo": "approve",
                "timerMs": 1000
            })),
            Node::new("approved", NodeKind::End),
            Node::new("escalated", NodeKind::End),
        ],
        vec![
            Edge::new("start", "approve"),
            Edge::new("approve", "approved"),
            Edge::new("sla_breach", "escalated"),
        ],
    );
    h.service.create_flow(flow).await.unwrap();

    let paused = h.engine.execute("sla", ExecutionContext::manual()).await.unwrap();
    let parked = h.engine.checkpoints().load(&paused.id).await.unwrap().unwrap();
    assert_eq!(parked.parked[0].boundary_node_id.as_deref(), Some("sla_breach"));

    let fired = h
        .engine
        .fire_due_timers(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(fired, 1);

    let log = h.engine.get_run(&paused.id).await.unwrap();
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.steps_for("approve").next().unwrap().status, StepStatus::Skipped);
    assert_eq!(log.steps_for("escalated").count(), 1);
    assert_eq!(log.steps_for("approved").count(), 0);

    // The approval arrives after the boundary consumed the cursor
    let late = h.engine.resume(&paused.id, None, json!({ "approved": true })).await.unwrap_err();
    assert_eq!(late.code(), "invalid_state");
}

/// Answers after a fixed delay
struct SlowTransport {
    delay: Duration,
    answered: AtomicU32,
}

#[async_trait]
impl HttpTransport for SlowTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ActionError> {
        tokio::time::sleep(self.delay).await;
        self.answered.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse {
            status: 200,
            headers: Default::default(),
            body: json!({ "ok": true }),
        })
    }
}

fn slow_call_flow(name: &str, hold_first: bool) -> mechaflow::flow::FlowDefinition {
    let mut nodes = vec![
        Node::new("start", NodeKind::Start),
        Node::new("call", NodeKind::HttpRequest).with_params(json!({ "url": "https://slow.example.test" })),
        Node::new("end", NodeKind::End),
    ];
    let mut edges = vec![Edge::new("call", "end")];
    if hold_first {
        nodes.push(Node::new("hold", NodeKind::Wait));
        edges.push(Edge::new("start", "hold"));
        edges.push(Edge::new("hold", "call"));
    } else {
        edges.push(Edge::new("start", "call"));
    }
    definition(name, nodes, edges)
}

#[tokio::test]
async fn cancel_lets_in_flight_call_finish() {
    let transport = Arc::new(SlowTransport {
        delay: Duration::from_millis(300),
        answered: AtomicU32::new(0),
    });
    let services = Collaborators::default().with_http(transport.clone());
    let h = harness_with(EngineConfig::default(), SchedulerConfig::default(), services).await;
    h.service.create_flow(slow_call_flow("slow_call", false)).await.unwrap();

    let admitted = h.engine.start("slow_call", ExecutionContext::manual()).await.unwrap();
    let id = admitted.execution_id().to_string();
    let walking = tokio::spawn(admitted.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.cancel(&id).await.unwrap();

    let log = walking.await.unwrap().unwrap();
    assert_eq!(log.status, ExecutionStatus::Cancelled);
    assert_eq!(transport.answered.load(Ordering::SeqCst), 1);
    let call: Vec<_> = log.steps_for("call").map(|s| s.status).collect();
    assert_eq!(call, vec![StepStatus::Success]);
    assert_eq!(log.steps_for("end").count(), 0);
    assert!(h.engine.concurrency_snapshot().await.is_empty());
}

#[tokio::test]
async fn racing_resumes_leave_the_winner_cancellable() {
    let transport = Arc::new(SlowTransport {
        delay: Duration::from_millis(300),
        answered: AtomicU32::new(0),
    });
    let services = Collaborators::default().with_http(transport);
    let h = harness_with(EngineConfig::default(), SchedulerConfig::default(), services).await;
    h.service.create_flow(slow_call_flow("double_resume", true)).await.unwrap();
    let paused = h.engine.execute("double_resume", ExecutionContext::manual()).await.unwrap();

    let resumes = (0..2).map(|_| {
        let engine = h.engine.clone();
        let id = paused.id.clone();
        tokio::spawn(async move { engine.resume(&id, None, json!({})).await })
    });
    let resumes: Vec<_> = resumes.collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.cancel(&paused.id).await.unwrap();

    let mut won = 0;
    for resume in resumes {
        match resume.await.unwrap() {
            Ok(log) => {
                won += 1;
                assert_eq!(log.status, ExecutionStatus::Cancelled);
            }
            Err(e) => assert!(matches!(e.code(), "checkpoint_not_found" | "invalid_state")),
        }
    }
    assert_eq!(won, 1);

    let log = h.engine.get_run(&paused.id).await.unwrap();
    assert_eq!(log.status, ExecutionStatus::Cancelled);
    assert_eq!(log.steps_for("end").count(), 0);
    assert!(h.engine.concurrency_snapshot().await.is_empty());
}

#[tokio::test]
async fn approval_inside_a_loop_resumes_on_the_right_iteration() {
    let h = harness().await;
    let flow = definition(
        "review_lines",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("each", NodeKind::Loop).with_params(json!({
                "collection": "$var.lines",
                "itemVariable": "line"
            })),
            Node::new("review", NodeKind::Wait).with_params(json!({ "reason": "approval" })),
            Node::new("end", NodeKind::End),
        ],
        vec![
            Edge::new("start", "each"),
            Edge::new("each", "review"),
            Edge::new("review", "each"),
            Edge::new("each", "end").default_edge(),
        ],
    );
    h.service.create_flow(flow).await.unwrap();

    let first = h
        .engine
        .execute("review_lines", ExecutionContext::manual().with_param("lines", json!(["a", "b"])))
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Paused);
    let checkpoint = h.engine.checkpoints().load(&first.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.parked[0].visit_key, "review");
    assert_eq!(checkpoint.variables["__loop.each"], 1);
    assert_eq!(checkpoint.variables["line"], "a");

    let second = h.engine.resume(&first.id, None, json!({ "ok_a": true })).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Paused);
    let checkpoint = h.engine.checkpoints().load(&first.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.parked[0].visit_key, "review#2");
    assert_eq!(checkpoint.variables["__loop.each"], 2);
    assert_eq!(checkpoint.variables["line"], "b");
    assert!(checkpoint.completed_node_ids.contains(&"each#2".to_string()));

    let done = h.engine.resume(&first.id, None, json!({ "ok_b": true })).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.steps_for("review").count(), 2);
    assert_eq!(done.steps_for("each").count(), 3);
    assert_eq!(done.steps_for("end").count(), 1);
    assert!(done.variables.get("__loop.each").is_none());
    assert_eq!(done.variables["ok_a"], true);
    assert_eq!(done.variables["ok_b"], true);
}
