/// Publish-time structural validation
///
/// Builds a petgraph view of the definition and checks the invariants the
/// engine relies on at run time. Runs on publish only; the walker assumes a
/// validated graph and reports anything it still trips over as a modeling error.

use crate::error::ValidationError;
use crate::flow::types::{FlowDefinition, NodeKind};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use std::collections::{HashMap, HashSet};

/// Validate a flow definition, returning the first problem found
pub fn validate_flow(flow: &FlowDefinition) -> Result<(), ValidationError> {
    if flow.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for node in &flow.nodes {
        if node.id.is_empty() || node.id.contains('#') {
            return Err(ValidationError::InvalidNodeId(node.id.clone()));
        }
        if index.contains_key(node.id.as_str()) {
            return Err(ValidationError::DuplicateNode(node.id.clone()));
        }
        index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    for edge in &flow.edges {
        let from = *index
            .get(edge.source.as_str())
            .ok_or_else(|| ValidationError::UnknownNode(edge.source.clone()))?;
        let to = *index
            .get(edge.target.as_str())
            .ok_or_else(|| ValidationError::UnknownNode(edge.target.clone()))?;
        graph.add_edge(from, to, ());
    }

    // Exactly one start, no incoming normal edges
    let starts: Vec<_> = flow
        .nodes
        .iter()
        .filter(|n| n.action == NodeKind::Start)
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(ValidationError::MissingStart),
        [one] => *one,
        many => return Err(ValidationError::MultipleStarts(many.len())),
    };
    if flow
        .edges
        .iter()
        .any(|e| e.target == start.id && !e.is_fault)
    {
        return Err(ValidationError::StartHasIncoming(start.id.clone()));
    }

    // Boundary events hang off their host rather than an incoming edge
    for boundary in flow.nodes.iter().filter(|n| n.action == NodeKind::BoundaryEvent) {
        let host_id = boundary.param_str("attachedTo").ok_or_else(|| {
            ValidationError::InvalidBoundary(boundary.id.clone(), "missing attachedTo".into())
        })?;
        let host = flow.node(host_id).ok_or_else(|| {
            ValidationError::InvalidBoundary(boundary.id.clone(), format!("unknown host '{host_id}'"))
        })?;
        if !host.action.can_attach_boundary_event() {
            return Err(ValidationError::InvalidBoundary(
                boundary.id.clone(),
                format!("'{}' cannot host boundary events", host.action),
            ));
        }
        if boundary.param_u64("timerMs").is_none() {
            return Err(ValidationError::InvalidBoundary(
                boundary.id.clone(),
                "missing timerMs".into(),
            ));
        }
        if !flow.edges.iter().any(|e| e.source == boundary.id) {
            return Err(ValidationError::InvalidBoundary(
                boundary.id.clone(),
                "no outgoing edge".into(),
            ));
        }
        graph.add_edge(index[host_id], index[boundary.id.as_str()], ());
    }

    for node in &flow.nodes {
        match node.action {
            NodeKind::End if flow.edges.iter().any(|e| e.source == node.id) => {
                return Err(ValidationError::EndHasOutgoing(node.id.clone()));
            }
            NodeKind::Decision
                if flow
                    .edges
                    .iter()
                    .filter(|e| e.source == node.id && e.is_default)
                    .count()
                    > 1 =>
            {
                return Err(ValidationError::MultipleDefaults(node.id.clone()));
            }
            _ => {}
        }
    }

    // Reachability from start
    let mut reachable = HashSet::new();
    let mut bfs = Bfs::new(&graph, index[start.id.as_str()]);
    while let Some(ix) = bfs.next(&graph) {
        reachable.insert(ix);
    }
    for node in &flow.nodes {
        if !reachable.contains(&index[node.id.as_str()]) {
            return Err(ValidationError::Unreachable(node.id.clone()));
        }
    }

    // Cycles are only allowed through loop nodes: drop edges into loops, then
    // any remaining strongly connected component is illegal.
    let loops: HashSet<NodeIndex> = flow
        .nodes
        .iter()
        .filter(|n| n.action == NodeKind::Loop)
        .map(|n| index[n.id.as_str()])
        .collect();
    let acyclic_view = graph.filter_map(|_, w| Some(*w), |e, _| {
        let (_, to) = graph.edge_endpoints(e)?;
        (!loops.contains(&to)).then_some(())
    });
    for component in tarjan_scc(&acyclic_view) {
        let self_loop = component.len() == 1
            && acyclic_view
                .edges(component[0])
                .any(|e| e.target() == component[0]);
        if component.len() > 1 || self_loop {
            return Err(ValidationError::IllegalCycle(
                acyclic_view[component[0]].to_string(),
            ));
        }
    }

    // Every parallel branch must be able to reach a join
    let joins: HashSet<NodeIndex> = flow
        .nodes
        .iter()
        .filter(|n| n.action == NodeKind::JoinGateway)
        .map(|n| index[n.id.as_str()])
        .collect();
    for gateway in flow.nodes.iter().filter(|n| n.action == NodeKind::ParallelGateway) {
        for edge in flow.edges.iter().filter(|e| e.source == gateway.id && !e.is_fault) {
            let mut bfs = Bfs::new(&graph, index[edge.target.as_str()]);
            let mut found = false;
            while let Some(ix) = bfs.next(&graph) {
                if joins.contains(&ix) {
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(ValidationError::MissingJoin {
                    gateway: gateway.id.clone(),
                    branch: edge.target.clone(),
                });
            }
        }
    }

    Ok(())
}
