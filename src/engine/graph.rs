//! Graph analysis: structural validation, trigger discovery, and a
//! deterministic execution order.
//!
//! The order is a topological sort of the nodes reachable from the trigger,
//! with ties among simultaneously eligible nodes broken by ascending node id
//! so identical inputs always produce identical runs. Nodes unreachable from
//! the trigger are dead code: never executed, never an error.

use crate::error::WorkflowError;
use crate::workflow::types::{Workflow, WorkflowNode};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Node types that can start a run.
pub const TRIGGER_TYPES: &[&str] = &["webhookTrigger", "schedule", "manualTrigger"];

/// Validated execution plan for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub trigger_id: String,
    /// Trigger-first topological order over reachable nodes.
    pub order: Vec<String>,
}

/// Locate the trigger node for an invocation. `kinds` narrows the search to
/// the adapter's trigger type(s); pass [`TRIGGER_TYPES`] for a manual run.
pub fn find_trigger<'a>(
    workflow: &'a Workflow,
    kinds: &[&str],
) -> Result<&'a WorkflowNode, WorkflowError> {
    let candidates: Vec<&WorkflowNode> = workflow
        .nodes
        .iter()
        .filter(|n| kinds.contains(&n.node_type.as_str()))
        .collect();
    match candidates.as_slice() {
        [] => Err(WorkflowError::NoTriggerFound),
        [single] => Ok(single),
        many => Err(WorkflowError::MultipleTriggerNodes(
            many.iter()
                .map(|n| n.id.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )),
    }
}

/// Validate the workflow's structure and compute the execution order from
/// the given trigger node.
pub fn plan(workflow: &Workflow, trigger_id: &str) -> Result<ExecutionPlan, WorkflowError> {
    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(WorkflowError::DuplicateNodeId(node.id.clone()));
        }
    }
    if !ids.contains(trigger_id) {
        return Err(WorkflowError::NoTriggerFound);
    }

    let mut target_ports = HashSet::new();
    for conn in &workflow.connections {
        for endpoint in [&conn.source_node_id, &conn.target_node_id] {
            if !ids.contains(endpoint.as_str()) {
                return Err(WorkflowError::DanglingConnection {
                    connection_id: conn.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
        // One source edge per (node, input port) keeps resolution
        // deterministic.
        if !target_ports.insert((conn.target_node_id.as_str(), conn.target_port())) {
            return Err(WorkflowError::PortConflict {
                node_id: conn.target_node_id.clone(),
                port: conn.target_port().to_string(),
            });
        }
    }

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &workflow.nodes {
        indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }
    for conn in &workflow.connections {
        graph.add_edge(
            indices[conn.source_node_id.as_str()],
            indices[conn.target_node_id.as_str()],
            (),
        );
    }
    if is_cyclic_directed(&graph) {
        return Err(WorkflowError::CycleDetected);
    }

    // Restrict to nodes reachable from the trigger. Error-handle edges count
    // as dependencies like any other.
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut frontier = VecDeque::from([trigger_id]);
    while let Some(id) = frontier.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        for conn in &workflow.connections {
            if conn.source_node_id == id {
                frontier.push_back(conn.target_node_id.as_str());
            }
        }
    }

    // Kahn's algorithm with a sorted ready set for the id tie-break.
    let mut indegree: HashMap<&str, usize> = reachable.iter().map(|id| (*id, 0)).collect();
    for conn in &workflow.connections {
        if reachable.contains(conn.source_node_id.as_str())
            && reachable.contains(conn.target_node_id.as_str())
        {
            if let Some(d) = indegree.get_mut(conn.target_node_id.as_str()) {
                *d += 1;
            }
        }
    }
    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(reachable.len());
    while let Some(id) = ready.iter().next().copied() {
        ready.remove(id);
        order.push(id.to_string());
        for conn in &workflow.connections {
            if conn.source_node_id == id && reachable.contains(conn.target_node_id.as_str()) {
                let d = indegree
                    .get_mut(conn.target_node_id.as_str())
                    .map(|d| {
                        *d -= 1;
                        *d
                    })
                    .unwrap_or(usize::MAX);
                if d == 0 {
                    ready.insert(conn.target_node_id.as_str());
                }
            }
        }
    }
    if order.len() != reachable.len() {
        return Err(WorkflowError::CycleDetected);
    }

    Ok(ExecutionPlan {
        trigger_id: trigger_id.to_string(),
        order,
    })
}

/// Execution order for an embedded sub-graph (loop bodies, branches, flow
/// groups). Same validation and tie-breaking as [`plan`], but with no
/// trigger: every node participates, roots are the zero-indegree nodes.
pub fn plan_subgraph(workflow: &Workflow) -> Result<Vec<String>, WorkflowError> {
    if workflow.nodes.is_empty() {
        return Ok(Vec::new());
    }
    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(WorkflowError::DuplicateNodeId(node.id.clone()));
        }
    }
    for conn in &workflow.connections {
        for endpoint in [&conn.source_node_id, &conn.target_node_id] {
            if !ids.contains(endpoint.as_str()) {
                return Err(WorkflowError::DanglingConnection {
                    connection_id: conn.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }

    let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    for conn in &workflow.connections {
        if let Some(d) = indegree.get_mut(conn.target_node_id.as_str()) {
            *d += 1;
        }
    }
    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(id) = ready.iter().next().copied() {
        ready.remove(id);
        order.push(id.to_string());
        for conn in &workflow.connections {
            if conn.source_node_id == id {
                if let Some(d) = indegree.get_mut(conn.target_node_id.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(conn.target_node_id.as_str());
                    }
                }
            }
        }
    }
    if order.len() != ids.len() {
        return Err(WorkflowError::CycleDetected);
    }
    Ok(order)
}

/// Upstream dependencies of `node_id`: the connections feeding any of its
/// input ports.
pub fn incoming<'a>(
    workflow: &'a Workflow,
    node_id: &str,
) -> impl Iterator<Item = &'a crate::workflow::types::WorkflowConnection> {
    let node_id = node_id.to_string();
    workflow
        .connections
        .iter()
        .filter(move |c| c.target_node_id == node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wf(nodes: serde_json::Value, connections: serde_json::Value) -> Workflow {
        serde_json::from_value(json!({"nodes": nodes, "connections": connections})).unwrap()
    }

    fn linear() -> Workflow {
        wf(
            json!([
                {"id": "trigger", "type": "webhookTrigger", "config": {}},
                {"id": "b", "type": "logMessage", "config": {}},
                {"id": "a", "type": "logMessage", "config": {}},
                {"id": "end", "type": "logMessage", "config": {}}
            ]),
            json!([
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "b"},
                {"id": "c2", "sourceNodeId": "trigger", "targetNodeId": "a", "targetHandle": "in2"},
                {"id": "c3", "sourceNodeId": "a", "targetNodeId": "end"},
                {"id": "c4", "sourceNodeId": "b", "targetNodeId": "end", "targetHandle": "other"}
            ]),
        )
    }

    #[test]
    fn order_is_topological_with_id_tiebreak() {
        let workflow = linear();
        let plan = plan(&workflow, "trigger").unwrap();
        // "a" and "b" become eligible together; ascending id wins.
        assert_eq!(plan.order, vec!["trigger", "a", "b", "end"]);
    }

    #[test]
    fn unreachable_nodes_are_dead_code_not_errors() {
        let workflow = wf(
            json!([
                {"id": "trigger", "type": "webhookTrigger", "config": {}},
                {"id": "next", "type": "logMessage", "config": {}},
                {"id": "island", "type": "logMessage", "config": {}}
            ]),
            json!([{"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "next"}]),
        );
        let plan = plan(&workflow, "trigger").unwrap();
        assert_eq!(plan.order, vec!["trigger", "next"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let workflow = wf(
            json!([
                {"id": "trigger", "type": "webhookTrigger", "config": {}},
                {"id": "a", "type": "logMessage", "config": {}},
                {"id": "b", "type": "logMessage", "config": {}}
            ]),
            json!([
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "a"},
                {"id": "c2", "sourceNodeId": "a", "targetNodeId": "b"},
                {"id": "c3", "sourceNodeId": "b", "targetNodeId": "a", "targetHandle": "loop"}
            ]),
        );
        assert!(matches!(
            plan(&workflow, "trigger"),
            Err(WorkflowError::CycleDetected)
        ));
    }

    #[test]
    fn dangling_connection_is_rejected() {
        let workflow = wf(
            json!([{"id": "trigger", "type": "webhookTrigger", "config": {}}]),
            json!([{"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "ghost"}]),
        );
        assert!(matches!(
            plan(&workflow, "trigger"),
            Err(WorkflowError::DanglingConnection { .. })
        ));
    }

    #[test]
    fn duplicate_target_port_is_rejected() {
        let workflow = wf(
            json!([
                {"id": "trigger", "type": "webhookTrigger", "config": {}},
                {"id": "a", "type": "logMessage", "config": {}},
                {"id": "b", "type": "logMessage", "config": {}}
            ]),
            json!([
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "b"},
                {"id": "c2", "sourceNodeId": "a", "targetNodeId": "b"}
            ]),
        );
        assert!(matches!(
            plan(&workflow, "trigger"),
            Err(WorkflowError::PortConflict { node_id, port }) if node_id == "b" && port == "input"
        ));
    }

    #[test]
    fn trigger_discovery() {
        let workflow = linear();
        assert_eq!(
            find_trigger(&workflow, &["webhookTrigger"]).unwrap().id,
            "trigger"
        );
        assert!(matches!(
            find_trigger(&workflow, &["schedule"]),
            Err(WorkflowError::NoTriggerFound)
        ));

        let two = wf(
            json!([
                {"id": "t1", "type": "schedule", "config": {}},
                {"id": "t2", "type": "schedule", "config": {}}
            ]),
            json!([]),
        );
        assert!(matches!(
            find_trigger(&two, &["schedule"]),
            Err(WorkflowError::MultipleTriggerNodes(_))
        ));
    }

    #[test]
    fn subgraph_plan_covers_all_nodes() {
        let workflow = wf(
            json!([
                {"id": "second", "type": "logMessage", "config": {}},
                {"id": "first", "type": "toUpperCase", "config": {}},
                {"id": "lone", "type": "logMessage", "config": {}}
            ]),
            json!([{"id": "c1", "sourceNodeId": "first", "targetNodeId": "second"}]),
        );
        assert_eq!(
            plan_subgraph(&workflow).unwrap(),
            vec!["first", "lone", "second"]
        );
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let workflow = wf(
            json!([
                {"id": "x", "type": "webhookTrigger", "config": {}},
                {"id": "x", "type": "logMessage", "config": {}}
            ]),
            json!([]),
        );
        assert!(matches!(
            plan(&workflow, "x"),
            Err(WorkflowError::DuplicateNodeId(id)) if id == "x"
        ));
    }
}
