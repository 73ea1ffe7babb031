//! Shared fixtures for integration tests

#![allow(dead_code)]

use mechaflow::config::{EngineConfig, SchedulerConfig};
use mechaflow::database::Database;
use mechaflow::flow::{ConcurrencyPolicy, Edge, FlowDefinition, FlowRegistry, FlowStatus, FlowStorage, Node, NodeKind};
use mechaflow::runtime::{ActionRegistry, Collaborators, Engine, Scheduler};
use mechaflow::service::FlowService;
use serde_json::json;
use std::sync::Arc;

pub struct Harness {
    pub database: Database,
    pub engine: Engine,
    pub scheduler: Arc<Scheduler>,
    pub service: FlowService,
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default(), SchedulerConfig::default(), Collaborators::default()).await
}

pub async fn harness_with(config: EngineConfig, scheduler: SchedulerConfig, services: Collaborators) -> Harness {
    let database = Database::connect_in_memory().await.unwrap();
    build(database, config, scheduler, services)
}

/// Fresh engine over an existing database, as after a process restart
pub fn build(database: Database, config: EngineConfig, scheduler: SchedulerConfig, services: Collaborators) -> Harness {
    let registry = Arc::new(FlowRegistry::new(FlowStorage::new(database.pool().clone())));
    let engine = Engine::with_parts(&database, registry, config, ActionRegistry::with_builtins(), services);
    let scheduler = Scheduler::new(&database, engine.clone(), scheduler);
    let service = FlowService::new(engine.clone(), Arc::clone(&scheduler));
    Harness {
        database,
        engine,
        scheduler,
        service,
    }
}

pub fn definition(name: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> FlowDefinition {
    FlowDefinition {
        name: name.into(),
        label: None,
        description: None,
        version: 1,
        status: FlowStatus::Active,
        enabled: true,
        nodes,
        edges,
        concurrency: ConcurrencyPolicy::default(),
        timeout_ms: None,
        max_retries: None,
    }
}

/// Orders above 1000 wait for an approval decision
pub fn approve_order() -> FlowDefinition {
    definition(
        "approve_order",
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("check_amount", NodeKind::Decision),
            Node::new("await_approval", NodeKind::Wait).with_params(json!({ "reason": "approval" })),
            Node::new("auto_approve", NodeKind::Assignment).with_params(json!({
                "assignments": [{ "variable": "approved", "value": true }]
            })),
            Node::new("end", NodeKind::End),
        ],
        vec![
            Edge::new("start", "check_amount"),
            Edge::new("check_amount", "await_approval").when("amount > 1000"),
            Edge::new("check_amount", "auto_approve").default_edge(),
            Edge::new("await_approval", "end"),
            Edge::new("auto_approve", "end"),
        ],
    )
}

/// Start straight into a signal wait; the run parks and keeps its slot
pub fn holding(name: &str) -> FlowDefinition {
    definition(
        name,
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("hold", NodeKind::Wait),
            Node::new("end", NodeKind::End),
        ],
        vec![Edge::new("start", "hold"), Edge::new("hold", "end")],
    )
}

/// A script that always fails without a fault edge
pub fn failing(name: &str) -> FlowDefinition {
    definition(
        name,
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("boom", NodeKind::Script).with_params(json!({ "source": "error('boom')" })),
            Node::new("end", NodeKind::End),
        ],
        vec![Edge::new("start", "boom"), Edge::new("boom", "end")],
    )
}
