//! Pure data-transform handlers. Deterministic, side-effect free (except
//! `logMessage` writing to the run trace and `delay` sleeping in live mode).

use super::{require_str, NodeCtx, NodeHandler};
use crate::error::{NodeError, NodeResult};
use crate::workflow::types::WorkflowNode;
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{json, Map, Value};

pub struct ParseJsonHandler;

#[async_trait]
impl NodeHandler for ParseJsonHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let data = match config.get("jsonString") {
            Some(Value::String(s)) if s.trim().is_empty() => json!({}),
            Some(Value::String(s)) => serde_json::from_str(s)
                .map_err(|e| NodeError::Config(format!("invalid JSON input string: {e}")))?,
            Some(v @ (Value::Object(_) | Value::Array(_))) => v.clone(),
            other => {
                return Err(NodeError::Config(format!(
                    "JSON input must be a string or object, got {}",
                    type_name(other)
                )))
            }
        };

        let path = config.get("path").and_then(Value::as_str).unwrap_or("");
        let path = path.trim();
        if path.is_empty() || path == "$" {
            return Ok(json!({"output": data}));
        }
        let normalized = if path.starts_with('$') {
            path.to_string()
        } else {
            format!("$.{path}")
        };
        let selected = jsonpath_lib::select(&data, &normalized)
            .map_err(|e| NodeError::Config(format!("invalid JSON path '{path}': {e}")))?;
        let extracted = match selected.as_slice() {
            [] => {
                return Err(NodeError::Config(format!(
                    "path '{path}' not found in JSON object"
                )))
            }
            [single] => (*single).clone(),
            many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
        };
        Ok(json!({"output": extracted}))
    }
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

pub struct ToUpperCaseHandler;

#[async_trait]
impl NodeHandler for ToUpperCaseHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let input = require_str(config, "inputString")?;
        Ok(json!({"output_data": input.to_uppercase()}))
    }
}

pub struct ToLowerCaseHandler;

#[async_trait]
impl NodeHandler for ToLowerCaseHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let input = require_str(config, "inputString")?;
        Ok(json!({"output_data": input.to_lowercase()}))
    }
}

pub struct ConcatenateStringsHandler;

#[async_trait]
impl NodeHandler for ConcatenateStringsHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let parts = config
            .get("stringsToConcatenate")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                NodeError::Config("'stringsToConcatenate' must be an array".to_string())
            })?;
        let separator = config
            .get("separator")
            .and_then(Value::as_str)
            .unwrap_or("");
        let joined = parts
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(separator);
        Ok(json!({"output_data": joined}))
    }
}

pub struct StringSplitHandler;

#[async_trait]
impl NodeHandler for StringSplitHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let input = require_str(config, "inputString")?;
        let delimiter = config
            .get("delimiter")
            .and_then(Value::as_str)
            .unwrap_or(",");
        let parts: Vec<Value> = input
            .split(delimiter)
            .map(|s| Value::String(s.to_string()))
            .collect();
        Ok(json!({"output_data": {"array": parts}}))
    }
}

pub struct FormatDateHandler;

#[async_trait]
impl NodeHandler for FormatDateHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let input = require_str(config, "inputDateString")?;
        let date = DateTime::parse_from_rfc3339(input)
            .map_err(|e| NodeError::Config(format!("invalid input date string: {e}")))?;
        let format = config
            .get("outputFormatString")
            .and_then(Value::as_str)
            .unwrap_or("%Y-%m-%d %H:%M:%S");
        Ok(json!({"output_data": {"formattedDate": date.format(format).to_string()}}))
    }
}

pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let delay_ms = config.get("delayMs").and_then(Value::as_u64).unwrap_or(0);
        if !ctx.mode.is_simulation() && delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        Ok(json!({"output": config.get("input").cloned().unwrap_or(Value::Null)}))
    }
}

pub struct LogMessageHandler;

#[async_trait]
impl NodeHandler for LogMessageHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let message = match config.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => serde_json::to_string_pretty(other)
                .map_err(|e| NodeError::Config(e.to_string()))?,
            None => String::new(),
        };
        ctx.log_info(format!(
            "[NODE LOGMESSAGE] {}: {message}",
            node.identifier()
        ));
        Ok(json!({"output": message}))
    }
}
