//! Core workflow type definitions.
//!
//! A workflow is a declarative graph of typed nodes plus directed
//! data-connections, supplied whole by a storage collaborator and never
//! mutated by the engine. These types mirror the JSON shape produced by the
//! workflow editor, so everything is `camelCase` on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Default source port when a connection omits `sourceHandle`.
pub const DEFAULT_SOURCE_HANDLE: &str = "output";
/// Default target port when a connection omits `targetHandle`.
pub const DEFAULT_TARGET_HANDLE: &str = "input";
/// Implicit handle every node exposes for failure routing.
pub const ERROR_HANDLE: &str = "error";

/// One step in a workflow graph, discriminated by its `type` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Unique, stable key within the workflow.
    pub id: String,
    /// Handler discriminator (e.g. "httpRequest", "forEach").
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Canvas layout position. Deserialized for round-tripping, ignored by
    /// the engine.
    #[serde(default)]
    pub position: Option<Position>,
    /// Key -> placeholder expression, evaluated against the parent context
    /// before `config` to produce node-local variables.
    #[serde(default)]
    pub input_mapping: Option<Map<String, Value>>,
    /// Arbitrary per-type parameters; values may contain `{{...}}`
    /// placeholders.
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub input_handles: Option<Vec<String>>,
    /// Named result channels. Every node additionally exposes the implicit
    /// `error` handle.
    #[serde(default)]
    pub output_handles: Option<Vec<String>>,
}

impl WorkflowNode {
    /// Human-friendly identifier for log messages.
    pub fn identifier(&self) -> String {
        match &self.name {
            Some(name) => format!("'{}' (id: {})", name, self.id),
            None => format!("(id: {})", self.id),
        }
    }

    /// Parsed retry policy from `config.retry`, if present.
    pub fn retry_config(&self) -> Option<RetryConfig> {
        self.config
            .get("retry")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Parsed on-error webhook from `config.onErrorWebhook`, if present.
    /// Accepts either an inline object or a JSON string (editor quirk).
    pub fn on_error_webhook(&self) -> Option<OnErrorWebhookConfig> {
        let raw = self.config.get("onErrorWebhook")?;
        match raw {
            Value::String(s) => serde_json::from_str(s).ok(),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }
}

/// Layout-only canvas coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Directed edge from one node's output port to another node's input port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConnection {
    pub id: String,
    pub source_node_id: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    pub target_node_id: String,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl WorkflowConnection {
    pub fn source_port(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(DEFAULT_SOURCE_HANDLE)
    }

    pub fn target_port(&self) -> &str {
        self.target_handle.as_deref().unwrap_or(DEFAULT_TARGET_HANDLE)
    }
}

/// A complete workflow definition: node set plus connection set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    pub connections: Vec<WorkflowConnection>,
}

impl Workflow {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All nodes of the given type, in definition order.
    pub fn nodes_of_type<'a>(
        &'a self,
        node_type: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowNode> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }
}

/// Retry policy carried in a node's `config.retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff_factor: Option<f64>,
    /// Only retry when the error message contains one of these keywords.
    #[serde(default)]
    pub retry_on_error_keywords: Option<Vec<String>>,
    /// HTTP status codes the editor marks as retryable. Eligibility checks
    /// match them against the failure message as `status <code>` substrings.
    #[serde(default)]
    pub retry_on_status_codes: Option<Vec<u16>>,
}

impl RetryConfig {
    /// Delay before the retry following `attempt` (1-based), applying
    /// exponential backoff when configured.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = self.backoff_factor.unwrap_or(1.0);
        (self.delay_ms as f64 * factor.powi(attempt.saturating_sub(1) as i32)) as u64
    }

    /// Whether the given failure is eligible for another attempt. With no
    /// filters configured every failure is retryable; otherwise at least one
    /// keyword or status code must match.
    pub fn should_retry(&self, error_message: &str) -> bool {
        let keywords = self
            .retry_on_error_keywords
            .as_deref()
            .unwrap_or_default();
        let codes = self.retry_on_status_codes.as_deref().unwrap_or_default();
        if keywords.is_empty() && codes.is_empty() {
            return true;
        }
        let lowered = error_message.to_lowercase();
        keywords
            .iter()
            .any(|kw| lowered.contains(&kw.to_lowercase()))
            || codes
                .iter()
                .any(|code| lowered.contains(&format!("status {code}")))
    }
}

/// Best-effort outbound notification fired when a node fails terminally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnErrorWebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<Map<String, Value>>,
    #[serde(default)]
    pub body_template: Option<Map<String, Value>>,
}

/// Nested sub-graph declared by a `parallel` branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    pub connections: Vec<WorkflowConnection>,
}

/// Execution mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// External-call nodes return caller-declared canned data; no side
    /// effects, no retries, no delays.
    #[default]
    Simulate,
    /// External-call nodes perform real side effects.
    Live,
}

impl ExecutionMode {
    pub fn is_simulation(self) -> bool {
        matches!(self, ExecutionMode::Simulate)
    }
}

/// Terminal status of one node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Error,
    Skipped,
}

/// Per-node, per-run output record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutput {
    pub status: NodeStatus,
    /// Resolved output payload; shape depends on the node type.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeOutput {
    pub fn success(payload: Value) -> Self {
        Self {
            status: NodeStatus::Success,
            payload,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn error(message: impl Into<String>, payload: Value) -> Self {
        Self {
            status: NodeStatus::Error,
            payload,
            error: Some(message.into()),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Skipped,
            payload: Value::Null,
            error: Some(reason.into()),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Severity of one entry in the execution trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
    Success,
}

/// One entry in the ordered, replayable execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(rename = "type")]
    pub level: LogLevel,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
        }
    }
}

/// Runtime state for one run (or one nested sub-graph invocation).
///
/// Created fresh per top-level run and per nested sub-graph call, and
/// discarded after the result is handed to the caller. A run never shares
/// mutable state with another run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Node id -> output record. Ordered map so serialized results are
    /// deterministic for identical inputs.
    pub outputs: BTreeMap<String, NodeOutput>,
    /// Cumulative ordered trace.
    pub logs: Vec<LogEntry>,
    pub mode: ExecutionMode,
}

impl ExecutionContext {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            outputs: BTreeMap::new(),
            logs: Vec::new(),
            mode,
        }
    }

    /// Context pre-seeded with trigger data (e.g. webhook request payload
    /// keyed by the trigger node's id).
    pub fn with_seed(mode: ExecutionMode, seed: BTreeMap<String, Value>) -> Self {
        let mut ctx = Self::new(mode);
        for (node_id, payload) in seed {
            ctx.outputs.insert(node_id, NodeOutput::success(payload));
        }
        ctx
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
            level,
        });
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn log_success(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Success, message);
    }

    /// Finalize the context into the unit returned to callers.
    pub fn into_result(self) -> WorkflowExecutionResult {
        WorkflowExecutionResult {
            node_outputs: self.outputs,
            logs: self.logs,
        }
    }
}

/// Final per-node records plus the ordered trace for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionResult {
    pub node_outputs: BTreeMap<String, NodeOutput>,
    pub logs: Vec<LogEntry>,
}

impl WorkflowExecutionResult {
    /// True when no node ended in `error` status.
    pub fn is_clean(&self) -> bool {
        self.node_outputs
            .values()
            .all(|o| o.status != NodeStatus::Error)
    }
}

/// Overall outcome of a persisted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Failed,
}

/// One persisted run-history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunRecord {
    pub id: String,
    pub workflow_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub result: WorkflowExecutionResult,
}
