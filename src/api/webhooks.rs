/// Inbound webhook trigger endpoint
///
/// `POST /webhooks/{*path}` matches the path suffix against registered
/// `webhookTrigger` nodes, authenticates against the node's optional
/// `securityToken`, and runs the workflow synchronously in live mode with
/// the request body, headers, and query seeded as the trigger's output.
/// `GET` answers subscription challenges without running anything.

use crate::{
    api::workflows::{persist_run, AppState},
    credentials::CredentialResolver,
    engine::resolver::{Resolver, Scope},
    workflow::types::{ExecutionMode, Workflow, WorkflowExecutionResult},
};
use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const TOKEN_HEADER: &str = "x-webhook-token";

/// Create webhook trigger routes
pub fn create_webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/webhooks/{*path}", post(handle_webhook))
        .route("/webhooks/{*path}", get(webhook_challenge))
}

/// Execute a workflow via webhook trigger
///
/// POST /webhooks/{*path}
async fn handle_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((workflow_id, compiled, trigger_node_id)) = state.registry.find_by_webhook_path(&path)
    else {
        tracing::warn!(path = %path, "webhook called for unknown path");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no workflow registered for path '{path}'") })),
        )
            .into_response();
    };
    let workflow = compiled.workflow;

    // Authenticate before touching the engine.
    let credentials = state.coordinator.credential_resolver();
    let expected = match trigger_token(credentials, &workflow, &trigger_node_id).await {
        Ok(token) => token,
        Err(status) => {
            tracing::error!(
                workflow = %workflow_id,
                "webhook token is configured but could not be resolved"
            );
            return (
                status,
                Json(json!({ "error": "webhook token could not be resolved" })),
            )
                .into_response();
        }
    };
    let provided = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if let Err(status) = check_token(expected.as_deref(), provided) {
        tracing::warn!(workflow = %workflow_id, "webhook authentication failed ({status})");
        return (status, Json(json!({ "error": "webhook authentication failed" }))).into_response();
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let request_body = parse_body(content_type, &body);
    let request_headers = headers_value(&headers);
    let request_query = query_value(raw_query.as_deref());

    let seed: BTreeMap<String, Value> = [(
        trigger_node_id,
        json!({
            "requestBody": request_body,
            "requestHeaders": request_headers,
            "requestQuery": request_query,
        }),
    )]
    .into();

    tracing::info!(workflow = %workflow_id, path = %path, "webhook run starting");
    match state
        .coordinator
        .execute(&workflow, &["webhookTrigger"], ExecutionMode::Live, seed)
        .await
    {
        Ok(result) => {
            persist_run(&state, &workflow, &workflow_id, &result).await;
            (result_status(&result), Json(result)).into_response()
        }
        Err(e) => {
            tracing::error!(workflow = %workflow_id, "webhook run rejected: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Subscription challenge / liveness probe
///
/// GET /webhooks/{*path}
async fn webhook_challenge(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let Some((workflow_id, _, _)) = state.registry.find_by_webhook_path(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Value::Object(query) = query_value(raw_query.as_deref()) {
        if let Some(Value::String(challenge)) = query.get("challenge") {
            return challenge.clone().into_response();
        }
    }
    Json(json!({ "status": "listening", "workflow": workflow_id })).into_response()
}

/// Resolve the trigger's configured token, honoring `{{credential.*}}` and
/// `{{env.*}}` placeholders. A token that is configured but does not resolve
/// to a non-empty string is an infrastructure failure, never an open
/// endpoint.
async fn trigger_token(
    credentials: &dyn CredentialResolver,
    workflow: &Workflow,
    trigger_node_id: &str,
) -> Result<Option<String>, StatusCode> {
    let Some(node) = workflow.node(trigger_node_id) else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let Some(raw) = node.config.get("securityToken").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }

    let resolver = Resolver::new(credentials);
    let locals = Map::new();
    let scope = Scope::new(&locals, Vec::new());
    let mut logs = Vec::new();
    let raw = Value::String(raw.to_string());
    match resolver.resolve_value(&raw, &scope, &mut logs).await {
        Value::String(token) if !token.is_empty() => Ok(Some(token)),
        _ => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Token decision: 401 when a required token is absent, 403 on mismatch.
fn check_token(expected: Option<&str>, provided: Option<&str>) -> Result<(), StatusCode> {
    match (expected, provided) {
        (None, _) => Ok(()),
        (Some(_), None) => Err(StatusCode::UNAUTHORIZED),
        (Some(want), Some(got)) if want == got => Ok(()),
        (Some(_), Some(_)) => Err(StatusCode::FORBIDDEN),
    }
}

/// 200 when every node succeeded, 207 when some node errored but the run
/// itself completed.
fn result_status(result: &WorkflowExecutionResult) -> StatusCode {
    if result.is_clean() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    }
}

/// Decode the request body according to its Content-Type.
fn parse_body(content_type: Option<&str>, body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Object(Map::new());
    }
    let kind = content_type.unwrap_or("").to_ascii_lowercase();

    if kind.contains("application/json") {
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
        // Malformed JSON degrades to the raw text.
        return Value::String(String::from_utf8_lossy(body).into_owned());
    }
    if kind.contains("application/x-www-form-urlencoded") {
        let mut map = Map::new();
        for (key, value) in url::form_urlencoded::parse(body) {
            map.insert(key.into_owned(), Value::String(value.into_owned()));
        }
        return Value::Object(map);
    }
    Value::String(String::from_utf8_lossy(body).into_owned())
}

fn headers_value(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

fn query_value(raw: Option<&str>) -> Value {
    let mut map = Map::new();
    if let Some(raw) = raw {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            map.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }
    Value::Object(map)
}
