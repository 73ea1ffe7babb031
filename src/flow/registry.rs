/// Hot-reload flow registry using ArcSwap
///
/// Provides lock-free, atomic updates to the in-memory set of compiled flows.
/// Each update swaps the whole map pointer; runs hold an `Arc<CompiledFlow>`
/// and keep walking the version they started with while newer versions load.

use crate::flow::{storage::FlowStorage, types::{Edge, FlowDefinition, Node, NodeKind}};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Flow definition compiled into an id-indexed arena
///
/// Nodes and edges stay in declaration order; lookups go through index maps
/// so the walker never holds references into the graph across suspensions.
#[derive(Debug)]
pub struct CompiledFlow {
    pub definition: FlowDefinition,
    node_index: HashMap<String, usize>,
    /// Non-fault outgoing edge indices per node, in declaration order
    outgoing: HashMap<String, Vec<usize>>,
    fault_edges: HashMap<String, usize>,
    incoming: HashMap<String, usize>,
    /// Host node id -> boundary event node indices
    boundaries: HashMap<String, Vec<usize>>,
    start: Option<usize>,
}

impl CompiledFlow {
    pub fn compile(definition: FlowDefinition) -> Self {
        let mut node_index = HashMap::new();
        let mut boundaries: HashMap<String, Vec<usize>> = HashMap::new();
        let mut start = None;

        for (i, node) in definition.nodes.iter().enumerate() {
            node_index.insert(node.id.clone(), i);
            match node.action {
                NodeKind::Start if start.is_none() => start = Some(i),
                NodeKind::BoundaryEvent => {
                    if let Some(host) = node.param_str("attachedTo") {
                        boundaries.entry(host.to_string()).or_default().push(i);
                    }
                }
                _ => {}
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut fault_edges = HashMap::new();
        let mut incoming: HashMap<String, usize> = HashMap::new();
        for (i, edge) in definition.edges.iter().enumerate() {
            if edge.is_fault {
                fault_edges.entry(edge.source.clone()).or_insert(i);
            } else {
                outgoing.entry(edge.source.clone()).or_default().push(i);
                *incoming.entry(edge.target.clone()).or_default() += 1;
            }
        }

        Self {
            definition,
            node_index,
            outgoing,
            fault_edges,
            incoming,
            boundaries,
            start,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.definition.nodes[i])
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.start.map(|i| &self.definition.nodes[i])
    }

    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(id)
            .map(|ix| ix.iter().map(|&i| &self.definition.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn fault_edge(&self, id: &str) -> Option<&Edge> {
        self.fault_edges.get(id).map(|&i| &self.definition.edges[i])
    }

    /// Number of normal edges arriving at a node (fan-in width of a join)
    pub fn incoming_count(&self, id: &str) -> usize {
        self.incoming.get(id).copied().unwrap_or(0)
    }

    pub fn boundaries_for(&self, host_id: &str) -> Vec<&Node> {
        self.boundaries
            .get(host_id)
            .map(|ix| ix.iter().map(|&i| &self.definition.nodes[i]).collect())
            .unwrap_or_default()
    }
}

/// Lock-free flow registry for hot-reload capabilities
///
/// The registry is the single in-memory source of truth for current flow
/// definitions. Older published versions are compiled on demand and cached.
#[derive(Debug)]
pub struct FlowRegistry {
    /// Key: flow name, Value: current compiled definition
    flows: ArcSwap<HashMap<String, Arc<CompiledFlow>>>,
    /// Key: (flow name, version) for runs pinned to superseded versions
    pinned: RwLock<HashMap<(String, u32), Arc<CompiledFlow>>>,
    storage: FlowStorage,
}

impl FlowRegistry {
    pub fn new(storage: FlowStorage) -> Self {
        Self {
            flows: ArcSwap::new(Arc::new(HashMap::new())),
            pinned: RwLock::new(HashMap::new()),
            storage,
        }
    }

    pub fn storage(&self) -> &FlowStorage {
        &self.storage
    }

    /// Populate the registry from storage (startup)
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_flows().await?;
        let compiled: HashMap<_, _> = stored
            .into_iter()
            .map(|flow| (flow.name.clone(), Arc::new(CompiledFlow::compile(flow))))
            .collect();

        self.flows.store(Arc::new(compiled));

        tracing::info!("Initialized flow registry with {} flows", self.flows.load().len());
        Ok(())
    }

    /// Hot-reload a single flow from storage
    pub async fn reload_flow(&self, name: &str) -> Result<()> {
        let flow = self
            .storage
            .get_flow(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", name))?;
        self.install(flow);
        tracing::info!(flow = name, "Hot-reloaded flow");
        Ok(())
    }

    /// Swap a definition into the registry without touching storage
    pub fn install(&self, flow: FlowDefinition) {
        let compiled = Arc::new(CompiledFlow::compile(flow));
        self.flows.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(compiled.name().to_string(), Arc::clone(&compiled));
            next
        });
    }

    /// Current definition (lock-free read)
    pub fn get_flow(&self, name: &str) -> Option<Arc<CompiledFlow>> {
        self.flows.load().get(name).cloned()
    }

    /// Definition pinned to a specific version
    ///
    /// Falls back to the frozen copy in storage when the registry has moved on.
    pub async fn get_version(&self, name: &str, version: u32) -> Result<Option<Arc<CompiledFlow>>> {
        if let Some(current) = self.get_flow(name) {
            if current.version() == version {
                return Ok(Some(current));
            }
        }

        let key = (name.to_string(), version);
        if let Some(cached) = self.pinned.read().await.get(&key) {
            return Ok(Some(Arc::clone(cached)));
        }

        match self.storage.get_version(name, version).await? {
            Some(flow) => {
                let compiled = Arc::new(CompiledFlow::compile(flow));
                self.pinned.write().await.insert(key, Arc::clone(&compiled));
                Ok(Some(compiled))
            }
            None => Ok(None),
        }
    }

    pub fn list_flow_names(&self) -> Vec<String> {
        self.flows.load().keys().cloned().collect()
    }

    pub fn remove_flow(&self, name: &str) {
        self.flows.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(name);
            next
        });
        tracing::info!(flow = name, "Removed flow from registry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::flow::types::{ConcurrencyPolicy, FlowStatus};
    use serde_json::json;

    fn definition(version: u32) -> FlowDefinition {
        FlowDefinition {
            name: "escalate".into(),
            label: None,
            description: None,
            version,
            status: FlowStatus::Active,
            enabled: true,
            nodes: vec![
                Node::new("start", NodeKind::Start),
                Node::new("call", NodeKind::HttpRequest),
                Node::new("timeout", NodeKind::BoundaryEvent)
                    .with_params(json!({ "attachedTo": "call", "timerMs": 50 })),
                Node::new("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "call"),
                Edge::new("call", "end"),
                Edge::new("call", "end").fault(),
                Edge::new("timeout", "end"),
            ],
            concurrency: ConcurrencyPolicy::default(),
            timeout_ms: None,
            max_retries: None,
        }
    }

    #[test]
    fn compiled_flow_indexes_edges() {
        let flow = CompiledFlow::compile(definition(1));
        assert_eq!(flow.start_node().unwrap().id, "start");
        assert_eq!(flow.outgoing("call").len(), 1);
        assert!(flow.fault_edge("call").is_some());
        assert_eq!(flow.incoming_count("end"), 2);
        assert_eq!(flow.boundaries_for("call")[0].id, "timeout");
    }

    #[tokio::test]
    async fn pinned_versions_resolve_from_storage() {
        let db = Database::connect_in_memory().await.unwrap();
        let storage = FlowStorage::new(db.pool().clone());
        storage.save_version(&definition(1)).await.unwrap();
        storage.save_flow(&definition(2)).await.unwrap();
        storage.save_version(&definition(2)).await.unwrap();

        let registry = FlowRegistry::new(storage);
        registry.init_from_storage().await.unwrap();

        assert_eq!(registry.get_flow("escalate").unwrap().version(), 2);
        let old = registry.get_version("escalate", 1).await.unwrap().unwrap();
        assert_eq!(old.version(), 1);
        assert!(registry.get_version("escalate", 9).await.unwrap().is_none());
    }
}
