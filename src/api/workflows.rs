/// Workflow management REST API endpoints
///
/// CRUD operations for workflow definitions with hot-reload registry sync,
/// a run-now execution endpoint, run history, and credential management.
/// Credential values are write-only; the API never returns them.

use crate::{
    engine::coordinator::ExecutionCoordinator,
    engine::graph,
    workflow::{
        registry::WorkflowRegistry,
        storage::WorkflowStorage,
        types::{
            ExecutionMode, RunStatus, Workflow, WorkflowExecutionResult, WorkflowRunRecord,
        },
    },
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow storage for persistence
    pub storage: WorkflowStorage,
    /// Hot-reload registry for in-memory workflows
    pub registry: Arc<WorkflowRegistry>,
    /// Execution coordinator for run-now and trigger-driven runs
    pub coordinator: Arc<ExecutionCoordinator>,
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Request body for workflow creation and update
#[derive(Debug, Deserialize)]
pub struct SaveWorkflowRequest {
    pub id: Option<String>,
    #[serde(flatten)]
    pub workflow: Workflow,
}

/// Request body for the run-now endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Optional payload seeded as the trigger node's output.
    #[serde(default)]
    pub initial_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RunHistoryQuery {
    pub limit: Option<i64>,
}

/// Request body for credential upsert
#[derive(Debug, Deserialize)]
pub struct SaveCredentialRequest {
    pub name: String,
    pub value: String,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}", put(update_workflow))
        .route("/api/workflows/{id}", delete(delete_workflow))
        .route("/api/workflows/{id}/execute", post(execute_workflow))
        .route("/api/workflows/{id}/runs", get(list_workflow_runs))
        .route("/api/runs", get(list_all_runs))
        .route("/api/credentials", post(save_credential))
        .route("/api/credentials", get(list_credentials))
        .route("/api/credentials/{name}", delete(delete_credential))
}

/// Create a new workflow
///
/// POST /api/workflows
/// Body: { "id": "...", "name": "...", "nodes": [...], "connections": [...] }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<SaveWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let id = payload
        .id
        .or_else(|| payload.workflow.name.clone())
        .ok_or(StatusCode::BAD_REQUEST)?;
    if id.is_empty() || payload.workflow.nodes.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => return Err(StatusCode::CONFLICT),
        Ok(None) => {}
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    save_and_reload(&state, &id, &payload.workflow).await?;
    tracing::info!(id = %id, "created workflow");

    Ok(Json(WorkflowResponse {
        message: format!("Workflow '{id}' created successfully"),
        id,
    }))
}

/// List all workflows
///
/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_workflows().await {
        Ok(workflows) => Ok(Json(json!({ "workflows": workflows }))),
        Err(e) => {
            tracing::error!("failed to list workflows: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Get a specific workflow by id
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    match state.storage.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("failed to get workflow {id}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Update an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SaveWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    if payload.workflow.nodes.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    save_and_reload(&state, &id, &payload.workflow).await?;
    tracing::info!(id = %id, "updated workflow");

    Ok(Json(WorkflowResponse {
        message: format!("Workflow '{id}' updated successfully"),
        id,
    }))
}

/// Delete a workflow
///
/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.registry.remove_workflow(&id);

    match state.storage.delete_workflow(&id).await {
        Ok(true) => {
            tracing::info!(id = %id, "deleted workflow");
            Ok(Json(json!({ "message": "Workflow deleted successfully" })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("failed to delete workflow: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Execute a workflow immediately
///
/// POST /api/workflows/{id}/execute
/// Body: { "mode": "simulate" | "live", "initialData": { ... } }
async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ExecuteWorkflowRequest>,
) -> Result<Json<WorkflowExecutionResult>, (StatusCode, Json<Value>)> {
    let Some(compiled) = state.registry.get_workflow(&id) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("workflow '{id}' not found") })),
        ));
    };
    let workflow = compiled.workflow;

    let mut seed = BTreeMap::new();
    if let Some(initial) = payload.initial_data {
        match graph::find_trigger(&workflow, graph::TRIGGER_TYPES) {
            Ok(trigger) => {
                seed.insert(trigger.id.clone(), initial);
            }
            Err(e) => {
                return Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "error": e.to_string() })),
                ));
            }
        }
    }

    let result = state
        .coordinator
        .execute(&workflow, graph::TRIGGER_TYPES, payload.mode, seed)
        .await
        .map_err(|e| {
            tracing::error!(id = %id, "run-now execution rejected: {e}");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": e.to_string() })),
            )
        })?;

    persist_run(&state, &workflow, &id, &result).await;
    Ok(Json(result))
}

/// Run history for one workflow
///
/// GET /api/workflows/{id}/runs?limit=50
async fn list_workflow_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunHistoryQuery>,
) -> Result<Json<Value>, StatusCode> {
    let name = match state.storage.get_workflow(&id).await {
        Ok(Some(workflow)) => workflow.name.unwrap_or_else(|| id.clone()),
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    };

    match state
        .storage
        .list_runs(Some(&name), query.limit.unwrap_or(50))
        .await
    {
        Ok(runs) => Ok(Json(json!({ "runs": runs }))),
        Err(e) => {
            tracing::error!("failed to list runs for {id}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Run history across all workflows
///
/// GET /api/runs?limit=50
async fn list_all_runs(
    State(state): State<AppState>,
    Query(query): Query<RunHistoryQuery>,
) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_runs(None, query.limit.unwrap_or(50)).await {
        Ok(runs) => Ok(Json(json!({ "runs": runs }))),
        Err(e) => {
            tracing::error!("failed to list runs: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Store or replace a credential
///
/// POST /api/credentials
/// Body: { "name": "SlackBotToken", "value": "..." }
async fn save_credential(
    State(state): State<AppState>,
    Json(payload): Json<SaveCredentialRequest>,
) -> Result<Json<Value>, StatusCode> {
    if payload.name.is_empty() || payload.value.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    match state.storage.set_credential(&payload.name, &payload.value).await {
        Ok(()) => {
            tracing::info!(name = %payload.name, "credential stored");
            Ok(Json(json!({ "message": "Credential stored", "name": payload.name })))
        }
        Err(e) => {
            tracing::error!("failed to store credential: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// List credential names (never values)
///
/// GET /api/credentials
async fn list_credentials(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_credential_names().await {
        Ok(names) => Ok(Json(json!({ "credentials": names }))),
        Err(e) => {
            tracing::error!("failed to list credentials: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Delete a credential
///
/// DELETE /api/credentials/{name}
async fn delete_credential(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.storage.delete_credential(&name).await {
        Ok(true) => Ok(Json(json!({ "message": "Credential deleted" }))),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("failed to delete credential: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn save_and_reload(
    state: &AppState,
    id: &str,
    workflow: &Workflow,
) -> Result<(), StatusCode> {
    if let Err(e) = state.storage.save_workflow(id, workflow).await {
        tracing::error!("failed to save workflow: {e}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if let Err(e) = state.registry.reload_workflow(id).await {
        tracing::error!("failed to reload workflow into registry: {e}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(())
}

/// Persist one run-history row. Failure to record never fails the request.
pub(crate) async fn persist_run(
    state: &AppState,
    workflow: &Workflow,
    fallback_name: &str,
    result: &WorkflowExecutionResult,
) {
    let record = WorkflowRunRecord {
        id: Uuid::new_v4().to_string(),
        workflow_name: workflow
            .name
            .clone()
            .unwrap_or_else(|| fallback_name.to_string()),
        timestamp: Utc::now(),
        status: if result.is_clean() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        },
        result: result.clone(),
    };
    if let Err(e) = state.storage.record_run(&record).await {
        tracing::error!(workflow = %record.workflow_name, "failed to record run: {e}");
    }
}
