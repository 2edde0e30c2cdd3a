//! Trigger node handlers.
//!
//! Live trigger data is seeded into the context by the trigger adapter
//! before the walk starts, in which case the coordinator never re-executes
//! the trigger node. These handlers therefore only run for simulation and
//! manual invocations, producing the declared stand-in data.

use super::{parse_maybe_json, NodeCtx, NodeHandler};
use crate::error::NodeResult;
use crate::workflow::types::WorkflowNode;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

pub struct WebhookTriggerHandler;

#[async_trait]
impl NodeHandler for WebhookTriggerHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        ctx.log_info(format!(
            "[NODE WEBHOOKTRIGGER] {}: using simulated request data.",
            node.identifier()
        ));
        let pick = |key: &str| {
            config
                .get(key)
                .map(parse_maybe_json)
                .unwrap_or_else(|| json!({}))
        };
        Ok(json!({
            "requestBody": pick("simulatedRequestBody"),
            "requestHeaders": pick("simulatedRequestHeaders"),
            "requestQuery": pick("simulatedRequestQuery"),
        }))
    }
}

pub struct ScheduleTriggerHandler;

#[async_trait]
impl NodeHandler for ScheduleTriggerHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        Ok(json!({
            "triggered_at": Utc::now().to_rfc3339(),
            "cron": config.get("cron").cloned().unwrap_or(Value::Null),
        }))
    }
}

pub struct ManualTriggerHandler;

#[async_trait]
impl NodeHandler for ManualTriggerHandler {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        config: &Map<String, Value>,
        _ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        Ok(json!({
            "input": config.get("input").cloned().unwrap_or_else(|| json!({})),
            "triggered_at": Utc::now().to_rfc3339(),
        }))
    }
}
