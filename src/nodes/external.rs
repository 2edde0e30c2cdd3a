//! External-call handlers: HTTP, AI, database, and third-party integrations.
//!
//! Every handler honors simulation mode by returning caller-declared canned
//! data (`simulatedResponse`, `simulatedOutput`, `simulated_config`, ...)
//! without touching the network. Live-mode failures map to [`NodeError`]
//! variants and stay subject to the node's retry policy.

use super::{parse_maybe_json, require_str, NodeCtx, NodeHandler};
use crate::error::{NodeError, NodeResult};
use crate::workflow::types::WorkflowNode;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Map, Value};
use std::time::Duration;

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

fn simulated_config(config: &Map<String, Value>) -> Value {
    config
        .get("simulated_config")
        .map(parse_maybe_json)
        .unwrap_or_else(|| json!({}))
}

fn header_map(config: &Map<String, Value>) -> Vec<(String, String)> {
    config
        .get("headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for HttpRequestHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE HTTPREQUEST] {}: SIMULATION, would make {method} request to {}",
                node.identifier(),
                config.get("url").and_then(Value::as_str).unwrap_or("?")
            ));
            let status = config
                .get("simulatedStatusCode")
                .and_then(Value::as_u64)
                .unwrap_or(200);
            if !(200..300).contains(&status) {
                return Err(NodeError::Http(format!(
                    "simulated HTTP error with status {status}"
                )));
            }
            let response = config
                .get("simulatedResponse")
                .map(parse_maybe_json)
                .unwrap_or_else(|| json!({}));
            return Ok(json!({"response": response, "status_code": status}));
        }

        let url = require_str(config, "url")?;
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| NodeError::Config(format!("unsupported HTTP method '{method}'")))?;
        let timeout_ms = config
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS);

        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(Duration::from_millis(timeout_ms));
        for (name, value) in header_map(config) {
            request = request.header(name, value);
        }
        if matches!(
            method,
            reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH
        ) {
            if let Some(body) = config.get("body") {
                request = match body {
                    Value::String(s) => request.body(s.clone()),
                    other => request.json(other),
                };
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(NodeError::Http(format!(
                "HTTP request failed with status {}: {text}",
                status.as_u16()
            )));
        }
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(json!({"response": parsed, "status_code": status.as_u16()}))
    }
}

pub struct AiTaskHandler {
    client: reqwest::Client,
}

impl AiTaskHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for AiTaskHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE AITASK] {}: SIMULATION, would send prompt to model {}",
                node.identifier(),
                config.get("model").and_then(Value::as_str).unwrap_or("default")
            ));
            let output = config
                .get("simulatedOutput")
                .cloned()
                .unwrap_or_else(|| Value::String("Simulated AI output.".to_string()));
            return Ok(json!({"output": output}));
        }

        let prompt = require_str(config, "prompt")?;
        let api_key = config
            .get("apiKey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                NodeError::Config(
                    "AI API key is not configured; set 'apiKey' (e.g. {{credential.OpenAIKey}}) \
                     or the OPENAI_API_KEY environment variable"
                        .to_string(),
                )
            })?;
        let model = config
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("gpt-4o-mini");

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(NodeError::External(format!(
                "AI API error: {}",
                body["error"]["message"].as_str().unwrap_or("unknown")
            )));
        }
        let output = body["choices"][0]["message"]["content"].clone();
        Ok(json!({"output": output}))
    }
}

pub struct DatabaseQueryHandler;

#[async_trait]
impl NodeHandler for DatabaseQueryHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE DATABASEQUERY] {}: SIMULATION, would execute query.",
                node.identifier()
            ));
            let results = config
                .get("simulatedResults")
                .cloned()
                .unwrap_or_else(|| json!([]));
            let row_count = config
                .get("simulatedRowCount")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| results.as_array().map(|a| a.len() as u64).unwrap_or(0));
            return Ok(json!({"results": results, "rowCount": row_count}));
        }

        let connection_string = config
            .get("connectionString")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| std::env::var("DB_CONNECTION_STRING").ok())
            .ok_or_else(|| {
                NodeError::Config(
                    "database connection string not found; set 'connectionString' (e.g. \
                     {{credential.DatabaseConnectionString}}) or DB_CONNECTION_STRING"
                        .to_string(),
                )
            })?;
        let query = require_str(config, "queryText")?;
        let params: Vec<String> = config
            .get("queryParams")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (client, connection) =
            tokio_postgres::connect(&connection_string, tokio_postgres::NoTls)
                .await
                .map_err(|e| NodeError::Database(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Postgres connection error: {}", e);
            }
        });

        let param_refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
            .iter()
            .map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();
        let rows = client
            .query(query, &param_refs)
            .await
            .map_err(|e| NodeError::Database(e.to_string()))?;
        let results: Vec<Value> = rows.iter().map(row_to_json).collect();
        Ok(json!({"results": results, "rowCount": rows.len()}))
    }
}

/// Best-effort conversion of a Postgres row to JSON, keyed by column name.
/// Unrecognized column types come back as null.
fn row_to_json(row: &tokio_postgres::Row) -> Value {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_().name() {
            "int2" => row
                .try_get::<_, Option<i16>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            "int4" => row
                .try_get::<_, Option<i32>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            "int8" => row
                .try_get::<_, Option<i64>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            "float4" => row
                .try_get::<_, Option<f32>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            "float8" => row
                .try_get::<_, Option<f64>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            "bool" => row
                .try_get::<_, Option<bool>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            "json" | "jsonb" => row.try_get::<_, Option<Value>>(i).ok().flatten(),
            _ => row
                .try_get::<_, Option<String>>(i)
                .ok()
                .flatten()
                .map(Value::String),
        };
        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(out)
}

pub struct SlackPostMessageHandler {
    client: reqwest::Client,
}

impl SlackPostMessageHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for SlackPostMessageHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE SLACK] {}: SIMULATION, would post to channel {}",
                node.identifier(),
                config.get("channel").and_then(Value::as_str).unwrap_or("?")
            ));
            let output = config
                .get("simulated_config")
                .map(parse_maybe_json)
                .unwrap_or_else(|| json!({"ok": true, "message": {"ts": "simulated_timestamp"}}));
            return Ok(json!({"output": output}));
        }

        let token = require_str(config, "token")?;
        let channel = require_str(config, "channel")?;
        let text = require_str(config, "text")?;

        let response = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(token)
            .json(&json!({"channel": channel, "text": text}))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() || body["ok"] != json!(true) {
            return Err(NodeError::External(format!(
                "Slack API error: {}",
                body["error"]
                    .as_str()
                    .unwrap_or(&format!("HTTP error {}", status.as_u16()))
            )));
        }
        Ok(json!({"output": body}))
    }
}

pub struct OpenAiChatCompletionHandler {
    client: reqwest::Client,
}

impl OpenAiChatCompletionHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for OpenAiChatCompletionHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE OPENAI] {}: SIMULATION, would send prompt to model {}",
                node.identifier(),
                config.get("model").and_then(Value::as_str).unwrap_or("?")
            ));
            return Ok(json!({"output": simulated_config(config)}));
        }

        let api_key = require_str(config, "apiKey")?;
        let messages = config
            .get("messages")
            .map(parse_maybe_json)
            .filter(Value::is_array)
            .ok_or_else(|| {
                NodeError::Config("'messages' must be an array of chat messages".to_string())
            })?;

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&json!({
                "model": config.get("model").cloned().unwrap_or(Value::Null),
                "messages": messages,
            }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(NodeError::External(format!(
                "OpenAI API error: {}",
                body["error"]["message"]
                    .as_str()
                    .unwrap_or(&format!("HTTP error {}", status.as_u16()))
            )));
        }
        Ok(json!({"output": body}))
    }
}

pub struct GithubCreateIssueHandler {
    client: reqwest::Client,
}

impl GithubCreateIssueHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for GithubCreateIssueHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE GITHUB] {}: SIMULATION, would create issue in {}/{}",
                node.identifier(),
                config.get("owner").and_then(Value::as_str).unwrap_or("?"),
                config.get("repo").and_then(Value::as_str).unwrap_or("?")
            ));
            return Ok(json!({"output": simulated_config(config)}));
        }

        let token = require_str(config, "token")?;
        let owner = require_str(config, "owner")?;
        let repo = require_str(config, "repo")?;

        let response = self
            .client
            .post(format!("https://api.github.com/repos/{owner}/{repo}/issues"))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "strandway-workflow-engine")
            .header("Authorization", format!("token {token}"))
            .json(&json!({
                "title": config.get("title").cloned().unwrap_or(Value::Null),
                "body": config.get("body").cloned().unwrap_or(Value::Null),
            }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(NodeError::External(format!(
                "GitHub API error: {}",
                body["message"]
                    .as_str()
                    .unwrap_or(&format!("HTTP error {}", status.as_u16()))
            )));
        }
        Ok(json!({"output": body}))
    }
}

/// SMTP relay settings come from `EMAIL_*` environment variables; per-node
/// config carries only the message itself.
pub struct SendEmailHandler;

fn email_env(name: &str) -> NodeResult<String> {
    std::env::var(name).map_err(|_| {
        NodeError::Config(
            "missing EMAIL_* environment variables; EMAIL_HOST, EMAIL_PORT, EMAIL_USER, \
             EMAIL_PASS and EMAIL_FROM are all required for live email delivery"
                .to_string(),
        )
    })
}

#[async_trait]
impl NodeHandler for SendEmailHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE SENDEMAIL] {}: SIMULATION, would send email to {}.",
                node.identifier(),
                config.get("to").and_then(Value::as_str).unwrap_or("?")
            ));
            let message_id = config
                .get("simulatedMessageId")
                .and_then(Value::as_str)
                .unwrap_or("simulated-email-id-default");
            return Ok(json!({"messageId": message_id}));
        }

        let host = email_env("EMAIL_HOST")?;
        let port: u16 = email_env("EMAIL_PORT")?
            .parse()
            .map_err(|_| NodeError::Config("EMAIL_PORT is not a valid port number".to_string()))?;
        let user = email_env("EMAIL_USER")?;
        let pass = email_env("EMAIL_PASS")?;
        let from = email_env("EMAIL_FROM")?;
        let secure = std::env::var("EMAIL_SECURE").map(|v| v == "true").unwrap_or(false);

        let to = require_str(config, "to")?;
        let subject = require_str(config, "subject")?;
        let body = require_str(config, "body")?;

        let message_id = format!("<{}@strandway>", uuid::Uuid::new_v4());
        let message = Message::builder()
            .from(from.parse().map_err(|e| {
                NodeError::Config(format!("EMAIL_FROM is not a valid address: {e}"))
            })?)
            .to(to.parse().map_err(|e| {
                NodeError::Config(format!("'to' is not a valid address: {e}"))
            })?)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())
            .map_err(|e| NodeError::Config(format!("could not build email: {e}")))?;

        let builder = if secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
                .map_err(|e| NodeError::External(format!("SMTP relay setup failed: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
        };
        let transport = builder.port(port).credentials(Credentials::new(user, pass)).build();
        transport
            .send(message)
            .await
            .map_err(|e| NodeError::External(format!("SMTP send failed: {e}")))?;
        Ok(json!({"messageId": message_id}))
    }
}

/// Integrations whose real API requires an OAuth2 flow the product does not
/// ship yet. They return their `simulated_config` payload in both modes so
/// workflows using them still complete end to end.
pub struct SimulatedLiveHandler {
    service: &'static str,
}

impl SimulatedLiveHandler {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

#[async_trait]
impl NodeHandler for SimulatedLiveHandler {
    async fn execute(
        &self,
        node: &WorkflowNode,
        config: &Map<String, Value>,
        ctx: &mut NodeCtx<'_>,
    ) -> NodeResult<Value> {
        let label = self.service.to_uppercase();
        if ctx.mode.is_simulation() {
            ctx.log_info(format!(
                "[NODE {label}] {}: SIMULATION, returning simulated data.",
                node.identifier()
            ));
        } else {
            ctx.log_info(format!(
                "[NODE {label}] {}: LIVE (SIMULATED): this integration requires OAuth2; \
                 returning simulated data for workflow continuity.",
                node.identifier()
            ));
            let has_creds = config
                .values()
                .any(|v| v.as_str().is_some_and(|s| s.contains("{{credential.")));
            if !has_creds {
                ctx.log_info(format!(
                    "[NODE {label}] WARNING: no credential placeholder found in config; \
                     real execution would fail."
                ));
            }
        }
        Ok(json!({"output": simulated_config(config)}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::ExecutionMode;

    fn node(node_type: &str, config: Value) -> WorkflowNode {
        serde_json::from_value(json!({"id": "n", "type": node_type, "config": config})).unwrap()
    }

    async fn simulate(handler: &dyn NodeHandler, node: &WorkflowNode) -> NodeResult<Value> {
        let mut logs = Vec::new();
        let mut ctx = NodeCtx {
            mode: ExecutionMode::Simulate,
            logs: &mut logs,
        };
        handler.execute(node, &node.config, &mut ctx).await
    }

    #[tokio::test]
    async fn http_simulation_honors_status_and_response() {
        let handler = HttpRequestHandler::new(reqwest::Client::new());
        let n = node(
            "httpRequest",
            json!({"url": "https://x", "simulatedResponse": "{\"users\": []}",
                   "simulatedStatusCode": 201}),
        );
        let out = simulate(&handler, &n).await.unwrap();
        assert_eq!(out["status_code"], 201);
        assert_eq!(out["response"]["users"], json!([]));

        let n = node("httpRequest", json!({"url": "https://x", "simulatedStatusCode": 503}));
        assert!(matches!(simulate(&handler, &n).await, Err(NodeError::Http(_))));
    }

    #[tokio::test]
    async fn ai_task_simulation_returns_declared_output() {
        let handler = AiTaskHandler::new(reqwest::Client::new());
        let n = node("aiTask", json!({"prompt": "hi", "simulatedOutput": "canned"}));
        assert_eq!(simulate(&handler, &n).await.unwrap()["output"], "canned");
    }

    #[tokio::test]
    async fn database_simulation_counts_rows() {
        let n = node(
            "databaseQuery",
            json!({"queryText": "SELECT 1", "simulatedResults": [{"id": 1}, {"id": 2}]}),
        );
        let out = simulate(&DatabaseQueryHandler, &n).await.unwrap();
        assert_eq!(out["rowCount"], 2);
    }

    #[tokio::test]
    async fn email_simulation_returns_declared_message_id() {
        let n = node(
            "sendEmail",
            json!({"to": "team@example.com", "subject": "hi", "body": "<p>hi</p>",
                   "simulatedMessageId": "sim-42"}),
        );
        let out = simulate(&SendEmailHandler, &n).await.unwrap();
        assert_eq!(out["messageId"], "sim-42");

        let n = node("sendEmail", json!({"to": "team@example.com"}));
        let out = simulate(&SendEmailHandler, &n).await.unwrap();
        assert_eq!(out["messageId"], "simulated-email-id-default");
    }

    #[tokio::test]
    async fn simulated_live_integration_works_in_both_modes() {
        let handler = SimulatedLiveHandler::new("Stripe");
        let n = node(
            "stripeCreatePaymentLink",
            json!({"simulated_config": {"url": "https://pay.example"}}),
        );
        let out = simulate(&handler, &n).await.unwrap();
        assert_eq!(out["output"]["url"], "https://pay.example");

        let mut logs = Vec::new();
        let mut ctx = NodeCtx {
            mode: ExecutionMode::Live,
            logs: &mut logs,
        };
        let out = handler.execute(&n, &n.config, &mut ctx).await.unwrap();
        assert_eq!(out["output"]["url"], "https://pay.example");
        assert!(logs.iter().any(|l| l.message.contains("OAuth2")));
    }
}
