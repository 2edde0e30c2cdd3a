//! Control-flow sub-interpreters: conditional gating, loops, parallel
//! branches, and nested flow invocation. Each one recurses into the
//! coordinator's flow walker for its embedded sub-graph.

use crate::engine::coordinator::{
    condition_passes, DispatchResult, ExecutionCoordinator, NodeFailure,
};
use crate::engine::graph::plan_subgraph;
use crate::engine::resolver::{Resolver, Scope};
use crate::error::NodeError;
use crate::nodes::parse_maybe_json;
use crate::workflow::types::{
    BranchConfig, ExecutionContext, NodeOutput, NodeStatus, Workflow, WorkflowNode,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

impl ExecutionCoordinator {
    pub(crate) async fn run_conditional(
        &self,
        node: &WorkflowNode,
        resolved: &Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> DispatchResult {
        let condition = resolved
            .get("condition")
            .ok_or_else(|| NodeError::Config("'condition' is not configured".to_string()))?;
        let result = condition_passes(condition);
        ctx.log_info(format!(
            "[NODE CONDITIONALLOGIC] {}: condition evaluated to {result}.",
            node.identifier()
        ));
        Ok(json!({"result": result}))
    }

    pub(crate) async fn run_for_each(
        &self,
        node: &WorkflowNode,
        resolved: &Map<String, Value>,
        ctx: &mut ExecutionContext,
        parent_outputs: Option<&BTreeMap<String, NodeOutput>>,
    ) -> DispatchResult {
        let items = resolved
            .get("inputArrayPath")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                NodeError::Config("'inputArrayPath' did not resolve to an array".to_string())
            })?;
        let sub = sub_workflow(resolved, "iterationNodes", "iterationConnections")?;
        let order = plan_subgraph(&sub)
            .map_err(|e| NodeError::Config(format!("invalid forEach sub-graph: {e}")))?;
        let merged = merged_outputs(ctx, parent_outputs);
        let label = format!("forEach:{}", node.id);

        let mut results = Vec::with_capacity(items.len());
        let mut failed = 0usize;
        for (index, item) in items.iter().enumerate() {
            let mut locals = Map::new();
            locals.insert("item".to_string(), item.clone());
            locals.insert("index".to_string(), json!(index));

            let mut nested = ExecutionContext::new(ctx.mode);
            self.execute_flow(&label, &sub, &order, &mut nested, &locals, Some(&merged))
                .await;

            let errored = has_error(&nested);
            if errored {
                failed += 1;
            }
            results.push(json!({
                "index": index,
                "status": if errored { "error" } else { "success" },
                "outputs": outputs_value(&nested),
            }));
            ctx.logs.append(&mut nested.logs);
        }

        let payload = json!({"iterations": results.len(), "results": results});
        if failed > 0 {
            return Err(NodeFailure {
                error: NodeError::SubFlow(format!(
                    "{failed} of {} forEach iterations failed",
                    items.len()
                )),
                payload,
            });
        }
        Ok(payload)
    }

    pub(crate) async fn run_while_loop(
        &self,
        node: &WorkflowNode,
        resolved: &Map<String, Value>,
        ctx: &mut ExecutionContext,
        parent_outputs: Option<&BTreeMap<String, NodeOutput>>,
    ) -> DispatchResult {
        // The raw template, re-resolved before every iteration so the
        // condition sees the latest sub-graph outputs.
        let template = node
            .config
            .get("condition")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| NodeError::Config("'condition' is not configured".to_string()))?;
        let cap = resolved
            .get("maxIterations")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.loop_limit);
        let sub = sub_workflow(resolved, "loopNodes", "loopConnections")?;
        let order = plan_subgraph(&sub)
            .map_err(|e| NodeError::Config(format!("invalid whileLoop sub-graph: {e}")))?;
        let merged = merged_outputs(ctx, parent_outputs);
        let label = format!("whileLoop:{}", node.id);

        // One nested context across iterations: outputs persist so the
        // condition and later iterations see the previous pass.
        let mut nested = ExecutionContext::new(ctx.mode);
        let mut iterations = 0usize;
        let resolver = Resolver::new(self.credentials.as_ref());
        loop {
            let mut locals = Map::new();
            locals.insert("iteration".to_string(), json!(iterations));
            let condition = {
                let scope = Scope::new(&locals, vec![&nested.outputs, &merged]);
                resolver
                    .resolve_value(&Value::String(template.clone()), &scope, &mut nested.logs)
                    .await
            };
            if !condition_passes(&condition) {
                break;
            }
            if iterations >= cap {
                let payload = json!({"iterations": iterations, "outputs": outputs_value(&nested)});
                ctx.logs.append(&mut nested.logs);
                return Err(NodeFailure {
                    error: NodeError::LoopLimitExceeded(cap),
                    payload,
                });
            }
            iterations += 1;
            self.execute_flow(&label, &sub, &order, &mut nested, &locals, Some(&merged))
                .await;
        }

        let payload = json!({"iterations": iterations, "outputs": outputs_value(&nested)});
        ctx.logs.append(&mut nested.logs);
        Ok(payload)
    }

    pub(crate) async fn run_parallel(
        &self,
        node: &WorkflowNode,
        resolved: &Map<String, Value>,
        ctx: &mut ExecutionContext,
        locals: &Map<String, Value>,
        parent_outputs: Option<&BTreeMap<String, NodeOutput>>,
    ) -> DispatchResult {
        let branches: Vec<BranchConfig> = resolved
            .get("branches")
            .map(parse_maybe_json)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| NodeError::Config(format!("invalid 'branches': {e}")))?
            .unwrap_or_default();
        let merged = merged_outputs(ctx, parent_outputs);
        let mode = ctx.mode;

        let mut handles = Vec::with_capacity(branches.len());
        for branch in branches {
            let coordinator = self.clone();
            let merged = merged.clone();
            // Branches keep the enclosing scope, e.g. a surrounding loop's
            // item/index variables.
            let locals = locals.clone();
            handles.push(tokio::spawn(async move {
                let sub = Workflow {
                    name: branch.name.clone(),
                    description: None,
                    nodes: branch.nodes,
                    connections: branch.connections,
                };
                let mut nested = ExecutionContext::new(mode);
                let outcome = match plan_subgraph(&sub) {
                    Ok(order) => {
                        let label = format!("parallel:{}", branch.id);
                        coordinator
                            .execute_flow(&label, &sub, &order, &mut nested, &locals, Some(&merged))
                            .await;
                        Ok(())
                    }
                    Err(e) => Err(format!("invalid branch sub-graph: {e}")),
                };
                (branch.id, branch.name, nested, outcome)
            }));
        }

        let total = handles.len();
        let mut entries = Vec::with_capacity(total);
        let mut failed = 0usize;
        for handle in handles {
            match handle.await {
                Ok((id, name, mut nested, outcome)) => {
                    let errored = outcome.is_err() || has_error(&nested);
                    if errored {
                        failed += 1;
                    }
                    ctx.logs.append(&mut nested.logs);
                    if let Err(message) = &outcome {
                        ctx.log_error(format!("[NODE PARALLEL] branch '{id}': {message}"));
                    }
                    entries.push(json!({
                        "id": id,
                        "name": name,
                        "status": if errored { "error" } else { "success" },
                        "outputs": outputs_value(&nested),
                    }));
                }
                Err(e) => {
                    failed += 1;
                    ctx.log_error(format!("[NODE PARALLEL] branch task panicked: {e}"));
                    entries.push(json!({"status": "error", "outputs": {}}));
                }
            }
        }
        ctx.log_info(format!(
            "[NODE PARALLEL] {}: {total} branches finished, {failed} failed.",
            node.identifier()
        ));

        let payload = json!({"branches": entries});
        if failed > 0 {
            return Err(NodeFailure {
                error: NodeError::SubFlow(format!("{failed} of {total} parallel branches failed")),
                payload,
            });
        }
        Ok(payload)
    }

    /// `executeFlowGroup` (embedded sub-graph) and `callExternalWorkflow`
    /// (resolved through the finder collaborator). The nested flow runs in a
    /// fresh context seeded with the calling node's mapped inputs.
    pub(crate) async fn run_flow_group(
        &self,
        node: &WorkflowNode,
        resolved: &Map<String, Value>,
        ctx: &mut ExecutionContext,
        parent_outputs: Option<&BTreeMap<String, NodeOutput>>,
    ) -> DispatchResult {
        let sub = if node.node_type == "callExternalWorkflow" {
            let reference = resolved
                .get("workflowId")
                .or_else(|| resolved.get("workflowName"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    NodeError::Config("'workflowId' is not configured or resolved".to_string())
                })?;
            self.finder.find(reference).await.ok_or_else(|| {
                NodeError::Config(format!("external workflow '{reference}' not found"))
            })?
        } else {
            sub_workflow(resolved, "flowGroupNodes", "flowGroupConnections")?
        };
        let order = plan_subgraph(&sub)
            .map_err(|e| NodeError::Config(format!("invalid flow-group sub-graph: {e}")))?;
        let merged = merged_outputs(ctx, parent_outputs);
        let locals = resolved
            .get("input")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let label = format!("flowGroup:{}", node.id);

        let mut nested = ExecutionContext::new(ctx.mode);
        self.execute_flow(&label, &sub, &order, &mut nested, &locals, Some(&merged))
            .await;

        let errored: usize = nested
            .outputs
            .values()
            .filter(|o| o.status == NodeStatus::Error)
            .count();
        let payload = outputs_value(&nested);
        ctx.logs.append(&mut nested.logs);
        if errored > 0 {
            return Err(NodeFailure {
                error: NodeError::SubFlow(format!("{errored} node(s) failed in nested flow")),
                payload,
            });
        }
        Ok(payload)
    }
}

/// Parse an embedded sub-graph out of the (unresolved) structural config
/// keys. The editor may supply them inline or as JSON strings.
fn sub_workflow(
    resolved: &Map<String, Value>,
    nodes_key: &str,
    connections_key: &str,
) -> Result<Workflow, NodeError> {
    let nodes = resolved
        .get(nodes_key)
        .map(parse_maybe_json)
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| NodeError::Config(format!("invalid '{nodes_key}': {e}")))?
        .unwrap_or_default();
    let connections = resolved
        .get(connections_key)
        .map(parse_maybe_json)
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| NodeError::Config(format!("invalid '{connections_key}': {e}")))?
        .unwrap_or_default();
    Ok(Workflow {
        name: None,
        description: None,
        nodes,
        connections,
    })
}

/// The outputs a nested flow may reference: everything the parent (and its
/// ancestors) produced so far, with the closest scope winning.
fn merged_outputs(
    ctx: &ExecutionContext,
    parent_outputs: Option<&BTreeMap<String, NodeOutput>>,
) -> BTreeMap<String, NodeOutput> {
    let mut merged = parent_outputs.cloned().unwrap_or_default();
    for (id, output) in &ctx.outputs {
        merged.insert(id.clone(), output.clone());
    }
    merged
}

fn has_error(ctx: &ExecutionContext) -> bool {
    ctx.outputs
        .values()
        .any(|o| o.status == NodeStatus::Error)
}

fn outputs_value(ctx: &ExecutionContext) -> Value {
    serde_json::to_value(&ctx.outputs).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialResolver;
    use crate::engine::coordinator::NoExternalWorkflows;
    use crate::engine::graph::TRIGGER_TYPES;
    use crate::nodes::NodeHandlerRegistry;
    use crate::workflow::types::ExecutionMode;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn coordinator() -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            Arc::new(NodeHandlerRegistry::builtin(reqwest::Client::new())),
            Arc::new(StaticCredentialResolver::default()),
            Arc::new(NoExternalWorkflows),
            reqwest::Client::new(),
            100,
        )
    }

    fn workflow(v: Value) -> Workflow {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn conditional_gates_downstream_nodes() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger",
                 "config": {"simulatedRequestBody": {"count": 2}}},
                {"id": "check", "type": "conditionalLogic",
                 "config": {"condition": "{{trigger.requestBody.count}} > 5"}},
                {"id": "gated", "type": "logMessage",
                 "config": {"message": "big", "_flow_run_condition": "{{check.result}}"}},
                {"id": "after", "type": "logMessage", "config": {"message": "tail"}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "check"},
                {"id": "c2", "sourceNodeId": "check", "targetNodeId": "gated"},
                {"id": "c3", "sourceNodeId": "gated", "targetNodeId": "after"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.node_outputs["check"].payload["result"], false);
        assert_eq!(result.node_outputs["gated"].status, NodeStatus::Skipped);
        // Skip propagates to downstream-only dependents.
        assert_eq!(result.node_outputs["after"].status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn for_each_runs_per_item_with_local_scope() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger",
                 "config": {"simulatedRequestBody": {"names": ["ann", "bo"]}}},
                {"id": "loop", "type": "forEach",
                 "config": {
                     "inputArrayPath": "{{trigger.requestBody.names}}",
                     "iterationNodes": [
                         {"id": "shout", "type": "toUpperCase",
                          "config": {"inputString": "{{item}}"}}
                     ],
                     "iterationConnections": []
                 }}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "loop"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let out = &result.node_outputs["loop"];
        assert_eq!(out.status, NodeStatus::Success);
        assert_eq!(out.payload["iterations"], 2);
        assert_eq!(
            out.payload["results"][0]["outputs"]["shout"]["payload"]["output_data"],
            "ANN"
        );
        assert_eq!(
            out.payload["results"][1]["outputs"]["shout"]["payload"]["output_data"],
            "BO"
        );
    }

    #[tokio::test]
    async fn for_each_aggregates_iteration_failures() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger",
                 "config": {"simulatedRequestBody": {"blobs": ["{\"ok\":1}", "{broken"]}}},
                {"id": "loop", "type": "forEach",
                 "config": {
                     "inputArrayPath": "{{trigger.requestBody.blobs}}",
                     "iterationNodes": [
                         {"id": "parse", "type": "parseJson",
                          "config": {"jsonString": "{{item}}"}}
                     ]
                 }}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "loop"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let out = &result.node_outputs["loop"];
        assert_eq!(out.status, NodeStatus::Error);
        assert_eq!(out.payload["results"][0]["status"], "success");
        assert_eq!(out.payload["results"][1]["status"], "error");
    }

    #[tokio::test]
    async fn while_loop_hits_iteration_cap() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "manualTrigger", "config": {}},
                {"id": "loop", "type": "whileLoop",
                 "config": {
                     "condition": "true",
                     "maxIterations": 5,
                     "loopNodes": [
                         {"id": "noop", "type": "logMessage", "config": {"message": "spin"}}
                     ]
                 }}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "loop"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let out = &result.node_outputs["loop"];
        assert_eq!(out.status, NodeStatus::Error);
        assert!(out
            .error
            .as_deref()
            .unwrap()
            .contains("iteration cap of 5"));
        assert_eq!(out.payload["iterations"], 5);
    }

    #[tokio::test]
    async fn while_loop_sees_latest_outputs() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "manualTrigger", "config": {}},
                {"id": "loop", "type": "whileLoop",
                 "config": {
                     // First evaluation: placeholder misses (empty) -> loop
                     // runs once; second evaluation sees "done" and stops.
                     "condition": "{{marker.output}} !== 'done'",
                     "loopNodes": [
                         {"id": "marker", "type": "logMessage",
                          "config": {"message": "done"}}
                     ]
                 }}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "loop"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let out = &result.node_outputs["loop"];
        assert_eq!(out.status, NodeStatus::Success);
        assert_eq!(out.payload["iterations"], 1);
    }

    #[tokio::test]
    async fn parallel_isolates_branch_failures() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "manualTrigger", "config": {}},
                {"id": "par", "type": "parallel",
                 "config": {"branches": [
                     {"id": "b1", "name": "ok-one", "connections": [],
                      "nodes": [{"id": "n", "type": "toUpperCase",
                                 "config": {"inputString": "one"}}]},
                     {"id": "b2", "name": "boom", "connections": [],
                      "nodes": [{"id": "n", "type": "parseJson",
                                 "config": {"jsonString": "{broken"}}]},
                     {"id": "b3", "name": "ok-two", "connections": [],
                      "nodes": [{"id": "n", "type": "toUpperCase",
                                 "config": {"inputString": "two"}}]}
                 ]}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "par"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let out = &result.node_outputs["par"];
        assert_eq!(out.status, NodeStatus::Error);
        let branches = out.payload["branches"].as_array().unwrap();
        assert_eq!(branches.len(), 3);
        assert_eq!(branches[0]["status"], "success");
        assert_eq!(branches[1]["status"], "error");
        assert_eq!(branches[2]["status"], "success");
        assert_eq!(
            branches[0]["outputs"]["n"]["payload"]["output_data"],
            "ONE"
        );
        assert_eq!(
            branches[2]["outputs"]["n"]["payload"]["output_data"],
            "TWO"
        );
    }

    #[tokio::test]
    async fn parallel_branches_keep_enclosing_loop_scope() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger",
                 "config": {"simulatedRequestBody": {"names": ["ann"]}}},
                {"id": "loop", "type": "forEach",
                 "config": {
                     "inputArrayPath": "{{trigger.requestBody.names}}",
                     "iterationNodes": [
                         {"id": "par", "type": "parallel",
                          "config": {"branches": [
                              {"id": "b1", "name": "shout", "connections": [],
                               "nodes": [{"id": "n", "type": "toUpperCase",
                                          "config": {"inputString": "{{item}}"}}]}
                          ]}}
                     ],
                     "iterationConnections": []
                 }}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "loop"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let out = &result.node_outputs["loop"];
        assert_eq!(out.status, NodeStatus::Success);
        assert_eq!(
            out.payload["results"][0]["outputs"]["par"]["payload"]["branches"][0]["outputs"]
                ["n"]["payload"]["output_data"],
            "ANN"
        );
    }

    #[tokio::test]
    async fn flow_group_seeds_nested_flow_with_mapped_input() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger",
                 "config": {"simulatedRequestBody": {"who": "pat"}}},
                {"id": "group", "type": "executeFlowGroup",
                 "inputMapping": {"who": "{{trigger.requestBody.who}}"},
                 "config": {
                     "flowGroupNodes": [
                         {"id": "greet", "type": "toUpperCase",
                          "config": {"inputString": "{{who}}"}}
                     ],
                     "flowGroupConnections": []
                 }}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "group"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let out = &result.node_outputs["group"];
        assert_eq!(out.status, NodeStatus::Success);
        assert_eq!(out.payload["greet"]["payload"]["output_data"], "PAT");
    }

    #[tokio::test]
    async fn call_external_workflow_uses_finder() {
        struct OneWorkflow;

        #[async_trait]
        impl crate::engine::coordinator::WorkflowFinder for OneWorkflow {
            async fn find(&self, reference: &str) -> Option<Workflow> {
                (reference == "greeter").then(|| {
                    serde_json::from_value(json!({
                        "nodes": [{"id": "hello", "type": "toUpperCase",
                                   "config": {"inputString": "{{who}}"}}],
                        "connections": []
                    }))
                    .unwrap()
                })
            }
        }

        let coordinator = ExecutionCoordinator::new(
            Arc::new(NodeHandlerRegistry::builtin(reqwest::Client::new())),
            Arc::new(StaticCredentialResolver::default()),
            Arc::new(OneWorkflow),
            reqwest::Client::new(),
            100,
        );
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "manualTrigger", "config": {}},
                {"id": "call", "type": "callExternalWorkflow",
                 "inputMapping": {"who": "sam"},
                 "config": {"workflowId": "greeter"}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "call"}
            ]
        }));
        let result = coordinator
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(
            result.node_outputs["call"].payload["hello"]["payload"]["output_data"],
            "SAM"
        );
    }
}
