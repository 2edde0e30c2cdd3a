//! Execution coordinator: walks a validated plan, resolves each node's
//! config, dispatches to handlers or control-flow interpreters, and applies
//! the retry and error-routing policy.
//!
//! Node-level failures never abort the run. The coordinator only returns an
//! error for structural problems found before execution starts.

use crate::credentials::CredentialResolver;
use crate::engine::graph::{self, TRIGGER_TYPES};
use crate::engine::resolver::{evaluate_condition, Resolver, Scope};
use crate::error::{NodeError, WorkflowError};
use crate::nodes::{NodeCtx, NodeHandlerRegistry};
use crate::workflow::types::{
    ExecutionContext, ExecutionMode, NodeOutput, NodeStatus, OnErrorWebhookConfig, Workflow,
    WorkflowExecutionResult, WorkflowNode, ERROR_HANDLE,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Locates externally addressed workflows for `callExternalWorkflow`.
#[async_trait]
pub trait WorkflowFinder: Send + Sync {
    async fn find(&self, reference: &str) -> Option<Workflow>;
}

/// Finder that knows no workflows. Suitable for tests and embedded use.
pub struct NoExternalWorkflows;

#[async_trait]
impl WorkflowFinder for NoExternalWorkflows {
    async fn find(&self, _reference: &str) -> Option<Workflow> {
        None
    }
}

/// A node failure that may still carry a partial payload (e.g. the outputs
/// of the parallel branches that did succeed).
pub struct NodeFailure {
    pub error: NodeError,
    pub payload: Value,
}

impl From<NodeError> for NodeFailure {
    fn from(error: NodeError) -> Self {
        Self {
            error,
            payload: Value::Null,
        }
    }
}

pub(crate) type DispatchResult = Result<Value, NodeFailure>;

#[derive(Clone)]
pub struct ExecutionCoordinator {
    pub(crate) registry: Arc<NodeHandlerRegistry>,
    pub(crate) credentials: Arc<dyn CredentialResolver>,
    pub(crate) finder: Arc<dyn WorkflowFinder>,
    pub(crate) http: reqwest::Client,
    pub(crate) loop_limit: usize,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<NodeHandlerRegistry>,
        credentials: Arc<dyn CredentialResolver>,
        finder: Arc<dyn WorkflowFinder>,
        http: reqwest::Client,
        loop_limit: usize,
    ) -> Self {
        Self {
            registry,
            credentials,
            finder,
            http,
            loop_limit,
        }
    }

    pub fn credential_resolver(&self) -> &dyn CredentialResolver {
        self.credentials.as_ref()
    }

    /// Run a workflow end to end. `seed` pre-populates node outputs (live
    /// trigger data keyed by the trigger node's id); entries for unknown
    /// node ids are dropped.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        trigger_kinds: &[&str],
        mode: ExecutionMode,
        seed: BTreeMap<String, Value>,
    ) -> Result<WorkflowExecutionResult, WorkflowError> {
        let trigger = graph::find_trigger(workflow, trigger_kinds)?;
        let plan = graph::plan(workflow, &trigger.id)?;

        let seed = seed
            .into_iter()
            .filter(|(id, _)| workflow.node(id).is_some())
            .collect();
        let mut ctx = ExecutionContext::with_seed(mode, seed);
        ctx.log_info(format!(
            "[ENGINE/main] Starting execution in {} mode.",
            if mode.is_simulation() { "SIMULATION" } else { "LIVE" }
        ));

        self.execute_flow("main", workflow, &plan.order, &mut ctx, &Map::new(), None)
            .await;
        Ok(ctx.into_result())
    }

    /// Walk one flow (the main graph or an embedded sub-graph) in plan
    /// order. Boxed so control-flow interpreters can recurse into it.
    pub(crate) fn execute_flow<'a>(
        &'a self,
        label: &'a str,
        workflow: &'a Workflow,
        order: &'a [String],
        ctx: &'a mut ExecutionContext,
        locals: &'a Map<String, Value>,
        parent_outputs: Option<&'a BTreeMap<String, NodeOutput>>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for node_id in order {
                let Some(node) = workflow.node(node_id) else {
                    continue;
                };
                let identifier = node.identifier();

                // Live trigger data was seeded by the adapter; don't
                // re-execute the trigger over it.
                if TRIGGER_TYPES.contains(&node.node_type.as_str())
                    && ctx.outputs.contains_key(node_id)
                {
                    ctx.log_info(format!(
                        "[ENGINE/{label}] Node {identifier}: using live trigger data."
                    ));
                    continue;
                }

                // Edge gating: success feeds normal ports, failure feeds the
                // error handle, skips feed nothing. A node whose executed
                // upstream edges all stayed dark is skipped itself.
                let incoming: Vec<_> = graph::incoming(workflow, node_id)
                    .filter(|c| ctx.outputs.contains_key(&c.source_node_id))
                    .collect();
                if !incoming.is_empty() {
                    let fired = incoming.iter().any(|c| {
                        match ctx.outputs[&c.source_node_id].status {
                            NodeStatus::Success => c.source_port() != ERROR_HANDLE,
                            NodeStatus::Error => c.source_port() == ERROR_HANDLE,
                            NodeStatus::Skipped => false,
                        }
                    });
                    if !fired {
                        ctx.log_info(format!(
                            "[ENGINE/{label}] Skipping node {identifier}: no input edge fired \
                             (upstream failed or skipped)."
                        ));
                        ctx.outputs.insert(
                            node_id.clone(),
                            NodeOutput::skipped("Upstream dependency failed or was skipped."),
                        );
                        continue;
                    }
                }

                let resolved = {
                    let mut chain = vec![&ctx.outputs];
                    if let Some(parent) = parent_outputs {
                        chain.push(parent);
                    }
                    let scope = Scope::new(locals, chain);
                    Resolver::new(self.credentials.as_ref())
                        .resolve_node_config(node, &scope, &mut ctx.logs)
                        .await
                };

                if let Some(condition) = resolved.get("_flow_run_condition") {
                    if !condition_passes(condition) {
                        ctx.log_info(format!(
                            "[ENGINE/{label}] Skipping node {identifier}: _flow_run_condition \
                             was falsy."
                        ));
                        ctx.outputs.insert(
                            node_id.clone(),
                            NodeOutput::skipped("_flow_run_condition was falsy."),
                        );
                        continue;
                    }
                }

                let retry = node.retry_config();
                let max_attempts = if ctx.mode.is_simulation() {
                    1
                } else {
                    retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1)
                };

                let started_at = Utc::now();
                let mut attempt = 0u32;
                let output = loop {
                    attempt += 1;
                    match self.dispatch(node, &resolved, ctx, locals, parent_outputs).await {
                        Ok(payload) => {
                            ctx.log_success(format!(
                                "[ENGINE/{label}] Node {identifier} completed."
                            ));
                            break NodeOutput::success(payload);
                        }
                        Err(failure) => {
                            let message = failure.error.to_string();
                            ctx.log_error(format!(
                                "[ENGINE/{label}] Node {identifier} failed on attempt \
                                 {attempt}: {message}"
                            ));
                            let retryable = retry
                                .as_ref()
                                .map(|r| r.should_retry(&message))
                                .unwrap_or(false);
                            if attempt >= max_attempts || !retryable {
                                ctx.log_error(format!(
                                    "[ENGINE/{label}] Node {identifier} FAILED permanently: \
                                     {message}"
                                ));
                                if let Some(webhook) = node.on_error_webhook() {
                                    self.send_error_webhook(
                                        node,
                                        &message,
                                        webhook,
                                        ctx,
                                        parent_outputs,
                                    )
                                    .await;
                                }
                                break NodeOutput::error(message, failure.payload);
                            }
                            let delay = retry
                                .as_ref()
                                .map(|r| r.delay_for_attempt(attempt))
                                .unwrap_or(0);
                            ctx.log_info(format!(
                                "[ENGINE/{label}] Node {identifier}: retrying in {delay}ms..."
                            ));
                            if delay > 0 {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                            }
                        }
                    }
                };

                let output = NodeOutput {
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                    ..output
                };
                ctx.outputs.insert(node_id.clone(), output);
            }
        })
    }

    async fn dispatch(
        &self,
        node: &WorkflowNode,
        resolved: &Map<String, Value>,
        ctx: &mut ExecutionContext,
        locals: &Map<String, Value>,
        parent_outputs: Option<&BTreeMap<String, NodeOutput>>,
    ) -> DispatchResult {
        match node.node_type.as_str() {
            "conditionalLogic" => self.run_conditional(node, resolved, ctx).await,
            "forEach" => self.run_for_each(node, resolved, ctx, parent_outputs).await,
            "whileLoop" => self.run_while_loop(node, resolved, ctx, parent_outputs).await,
            "parallel" => {
                self.run_parallel(node, resolved, ctx, locals, parent_outputs)
                    .await
            }
            "executeFlowGroup" | "callExternalWorkflow" => {
                self.run_flow_group(node, resolved, ctx, parent_outputs).await
            }
            other => {
                let handler = self
                    .registry
                    .get(other)
                    .ok_or_else(|| NodeError::UnknownNodeType(other.to_string()))?;
                let mut node_ctx = NodeCtx {
                    mode: ctx.mode,
                    logs: &mut ctx.logs,
                };
                handler
                    .execute(node, resolved, &mut node_ctx)
                    .await
                    .map_err(NodeFailure::from)
            }
        }
    }

    /// Best-effort on-error notification. Resolution happens inline so the
    /// error context is captured; the HTTP send is spawned and never awaited.
    async fn send_error_webhook(
        &self,
        node: &WorkflowNode,
        error_message: &str,
        webhook: OnErrorWebhookConfig,
        ctx: &mut ExecutionContext,
        parent_outputs: Option<&BTreeMap<String, NodeOutput>>,
    ) {
        let snapshot = serde_json::to_string(&ctx.outputs).unwrap_or_default();
        let mut error_scope = Map::new();
        error_scope.insert("failed_node_id".to_string(), json!(node.id));
        error_scope.insert(
            "failed_node_name".to_string(),
            json!(node.name.clone().unwrap_or_else(|| node.id.clone())),
        );
        error_scope.insert("error_message".to_string(), json!(error_message));
        error_scope.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        error_scope.insert("workflow_data_snapshot_json".to_string(), json!(snapshot));

        ctx.log_info(format!(
            "[ON_ERROR_WEBHOOK] Node {}: sending on-error webhook to {}",
            node.identifier(),
            webhook.url
        ));

        let (headers, body) = {
            let mut chain = vec![&ctx.outputs];
            if let Some(parent) = parent_outputs {
                chain.push(parent);
            }
            let scope = Scope::new(&error_scope, chain);
            let resolver = Resolver::new(self.credentials.as_ref());
            let headers = match &webhook.headers {
                Some(map) => {
                    let mut out = Map::new();
                    for (k, v) in map {
                        out.insert(k.clone(), resolver.resolve_value(v, &scope, &mut ctx.logs).await);
                    }
                    out
                }
                None => Map::new(),
            };
            let body = match &webhook.body_template {
                Some(map) => {
                    let mut out = Map::new();
                    for (k, v) in map {
                        out.insert(k.clone(), resolver.resolve_value(v, &scope, &mut ctx.logs).await);
                    }
                    Value::Object(out)
                }
                None => json!({}),
            };
            (headers, body)
        };

        let client = self.http.clone();
        let method = webhook.method.unwrap_or_else(|| "POST".to_string());
        let url = webhook.url;
        tokio::spawn(async move {
            let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                .unwrap_or(reqwest::Method::POST);
            let mut request = client.request(method, &url).json(&body);
            for (name, value) in &headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
            if let Err(e) = request.send().await {
                tracing::warn!("On-error webhook to {} failed: {}", url, e);
            }
        });
    }
}

/// `_flow_run_condition` gate: typed booleans are taken directly, anything
/// else goes through the condition evaluator.
pub(crate) fn condition_passes(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => evaluate_condition(s),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialResolver;
    use crate::error::NodeResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            Arc::new(NodeHandlerRegistry::builtin(reqwest::Client::new())),
            Arc::new(StaticCredentialResolver::default()),
            Arc::new(NoExternalWorkflows),
            reqwest::Client::new(),
            100,
        )
    }

    fn coordinator_with(registry: NodeHandlerRegistry) -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            Arc::new(registry),
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
    async fn linear_flow_propagates_data() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger",
                 "config": {"simulatedRequestBody": {"name": "ada"}}},
                {"id": "upper", "type": "toUpperCase",
                 "config": {"inputString": "{{trigger.requestBody.name}}"}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "upper"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.node_outputs["upper"].status, NodeStatus::Success);
        assert_eq!(result.node_outputs["upper"].payload["output_data"], "ADA");
        assert!(result.is_clean());
    }

    #[tokio::test]
    async fn seeded_trigger_is_not_reexecuted() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger", "config": {}},
                {"id": "upper", "type": "toUpperCase",
                 "config": {"inputString": "{{trigger.requestBody.name}}"}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "upper"}
            ]
        }));
        let mut seed = BTreeMap::new();
        seed.insert("trigger".to_string(), json!({"requestBody": {"name": "live"}}));
        let result = coordinator()
            .execute(&wf, &["webhookTrigger"], ExecutionMode::Live, seed)
            .await
            .unwrap();
        assert_eq!(result.node_outputs["upper"].payload["output_data"], "LIVE");
        assert_eq!(
            result.node_outputs["trigger"].payload["requestBody"]["name"],
            "live"
        );
    }

    #[tokio::test]
    async fn failed_node_routes_error_handle_and_skips_normal_edge() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger", "config": {}},
                {"id": "bad", "type": "parseJson", "config": {"jsonString": "{nope"}},
                {"id": "next", "type": "logMessage", "config": {"message": "normal path"}},
                {"id": "onfail", "type": "logMessage",
                 "config": {"message": "failure was: {{bad.error_message}}"}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "bad"},
                {"id": "c2", "sourceNodeId": "bad", "targetNodeId": "next"},
                {"id": "c3", "sourceNodeId": "bad", "sourceHandle": "error",
                 "targetNodeId": "onfail"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.node_outputs["bad"].status, NodeStatus::Error);
        assert_eq!(result.node_outputs["next"].status, NodeStatus::Skipped);
        assert_eq!(result.node_outputs["onfail"].status, NodeStatus::Success);
        let message = result.node_outputs["onfail"].payload["output"]
            .as_str()
            .unwrap();
        assert!(message.contains("invalid JSON input string"));
        assert!(!result.is_clean());
    }

    #[tokio::test]
    async fn retry_exhaustion_logs_every_attempt() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "manualTrigger", "config": {}},
                {"id": "bad", "type": "parseJson",
                 "config": {"jsonString": "{nope", "retry": {"attempts": 3, "delayMs": 0}}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "bad"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Live, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.node_outputs["bad"].status, NodeStatus::Error);
        let attempts = result
            .logs
            .iter()
            .filter(|l| l.message.contains("failed on attempt"))
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        struct FailOnce(AtomicUsize);

        #[async_trait]
        impl crate::nodes::NodeHandler for FailOnce {
            async fn execute(
                &self,
                _node: &WorkflowNode,
                _config: &Map<String, Value>,
                _ctx: &mut NodeCtx<'_>,
            ) -> NodeResult<Value> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(NodeError::External("transient".to_string()))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        }

        let mut registry = NodeHandlerRegistry::builtin(reqwest::Client::new());
        registry.register("flaky", Arc::new(FailOnce(AtomicUsize::new(0))));
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "manualTrigger", "config": {}},
                {"id": "f", "type": "flaky",
                 "config": {"retry": {"attempts": 3, "delayMs": 0}}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "f"}
            ]
        }));
        let result = coordinator_with(registry)
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Live, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.node_outputs["f"].status, NodeStatus::Success);
        let attempts = result
            .logs
            .iter()
            .filter(|l| l.message.contains("failed on attempt"))
            .count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn unknown_node_type_is_contained() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "manualTrigger", "config": {}},
                {"id": "odd", "type": "mystery", "config": {}},
                {"id": "other", "type": "logMessage", "config": {"message": "independent"}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "odd"},
                {"id": "c2", "sourceNodeId": "trigger", "targetNodeId": "other"}
            ]
        }));
        let result = coordinator()
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.node_outputs["odd"].status, NodeStatus::Error);
        assert_eq!(result.node_outputs["other"].status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn simulate_mode_is_deterministic() {
        let wf = workflow(json!({
            "nodes": [
                {"id": "trigger", "type": "webhookTrigger",
                 "config": {"simulatedRequestBody": {"xs": ["b", "a"]}}},
                {"id": "n2", "type": "concatenateStrings",
                 "config": {"stringsToConcatenate": "{{trigger.requestBody.xs}}",
                            "separator": "+"}},
                {"id": "n1", "type": "logMessage",
                 "config": {"message": "{{trigger.requestBody.xs.0}}"}}
            ],
            "connections": [
                {"id": "c1", "sourceNodeId": "trigger", "targetNodeId": "n2"},
                {"id": "c2", "sourceNodeId": "trigger", "targetNodeId": "n1"}
            ]
        }));
        let c = coordinator();
        let a = c
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let b = c
            .execute(&wf, TRIGGER_TYPES, ExecutionMode::Simulate, BTreeMap::new())
            .await
            .unwrap();
        let strip = |r: &WorkflowExecutionResult| {
            r.node_outputs
                .iter()
                .map(|(id, o)| (id.clone(), o.status, o.payload.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&a), strip(&b));
    }
}
