//! Node handlers: one executable unit per node `type`.
//!
//! Handlers receive their fully resolved configuration and return an output
//! payload or a [`NodeError`]. They are registered in an explicit
//! [`NodeHandlerRegistry`] injected into the coordinator; there is no global
//! registration state, so concurrent runs never contend.

pub mod external;
pub mod transform;
pub mod triggers;

use crate::error::{NodeError, NodeResult};
use crate::workflow::types::{ExecutionMode, LogEntry, WorkflowNode};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-invocation handler context: execution mode plus the run's ordered
/// trace for handlers that log (e.g. `logMessage`, simulation notices).
pub struct NodeCtx<'a> {
    pub mode: ExecutionMode,
    pub logs: &'a mut Vec<LogEntry>,
}

impl NodeCtx<'_> {
    pub fn log_info(&mut self, message: impl Into<String>) {
        self.logs
            .push(LogEntry::new(crate::workflow::types::LogLevel::Info, message));
    }
}

/// One executable node type.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value>;
}

/// Maps a node `type` string to its handler. Built once at startup and
/// shared read-only across runs.
#[derive(Clone, Default)]
pub struct NodeHandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registry pre-populated with every built-in handler.
    pub fn builtin(http: reqwest::Client) -> Self {
        let mut registry = Self::new();

        registry.register("webhookTrigger", Arc::new(triggers::WebhookTriggerHandler));
        registry.register("schedule", Arc::new(triggers::ScheduleTriggerHandler));
        registry.register("manualTrigger", Arc::new(triggers::ManualTriggerHandler));

        registry.register("parseJson", Arc::new(transform::ParseJsonHandler));
        registry.register("toUpperCase", Arc::new(transform::ToUpperCaseHandler));
        registry.register("toLowerCase", Arc::new(transform::ToLowerCaseHandler));
        registry.register(
            "concatenateStrings",
            Arc::new(transform::ConcatenateStringsHandler),
        );
        registry.register("stringSplit", Arc::new(transform::StringSplitHandler));
        registry.register("formatDate", Arc::new(transform::FormatDateHandler));
        registry.register("delay", Arc::new(transform::DelayHandler));
        registry.register("logMessage", Arc::new(transform::LogMessageHandler));

        registry.register(
            "httpRequest",
            Arc::new(external::HttpRequestHandler::new(http.clone())),
        );
        registry.register(
            "aiTask",
            Arc::new(external::AiTaskHandler::new(http.clone())),
        );
        registry.register("databaseQuery", Arc::new(external::DatabaseQueryHandler));
        registry.register("sendEmail", Arc::new(external::SendEmailHandler));
        registry.register(
            "slackPostMessage",
            Arc::new(external::SlackPostMessageHandler::new(http.clone())),
        );
        registry.register(
            "openAiChatCompletion",
            Arc::new(external::OpenAiChatCompletionHandler::new(http.clone())),
        );
        registry.register(
            "githubCreateIssue",
            Arc::new(external::GithubCreateIssueHandler::new(http)),
        );

        // OAuth-heavy integrations ship as simulated-live: they return their
        // `simulated_config` payload in both modes until real OAuth lands.
        for (node_type, service) in [
            ("googleSheetsAppendRow", "Google Sheets"),
            ("stripeCreatePaymentLink", "Stripe"),
            ("hubspotCreateContact", "HubSpot"),
            ("twilioSendSms", "Twilio"),
            ("dropboxUploadFile", "Dropbox"),
            ("googleCalendarListEvents", "Google Calendar"),
        ] {
            registry.register(
                node_type,
                Arc::new(external::SimulatedLiveHandler::new(service)),
            );
        }

        registry
    }
}

/// A JSON value that the editor may supply either inline or as a JSON
/// string. Strings are parsed; parse failures fall back to the raw string.
pub(crate) fn parse_maybe_json(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

pub(crate) fn require_str<'a>(config: &'a Map<String, Value>, key: &str) -> NodeResult<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::Config(format!("'{key}' is not configured or resolved")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_every_shipped_type() {
        let registry = NodeHandlerRegistry::builtin(reqwest::Client::new());
        for node_type in [
            "webhookTrigger",
            "schedule",
            "manualTrigger",
            "parseJson",
            "toUpperCase",
            "toLowerCase",
            "concatenateStrings",
            "stringSplit",
            "formatDate",
            "delay",
            "logMessage",
            "httpRequest",
            "aiTask",
            "databaseQuery",
            "slackPostMessage",
            "openAiChatCompletion",
            "githubCreateIssue",
            "googleSheetsAppendRow",
            "stripeCreatePaymentLink",
            "hubspotCreateContact",
            "twilioSendSms",
            "dropboxUploadFile",
            "googleCalendarListEvents",
        ] {
            assert!(registry.contains(node_type), "missing {node_type}");
        }
        assert!(!registry.contains("mystery"));
    }

    #[test]
    fn maybe_json_parses_strings() {
        assert_eq!(
            parse_maybe_json(&Value::String("{\"a\":1}".into())),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            parse_maybe_json(&Value::String("not json".into())),
            Value::String("not json".into())
        );
    }
}
