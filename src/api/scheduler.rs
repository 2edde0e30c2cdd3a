/// Scheduler poll endpoint
///
/// An external cron (or k8s CronJob) POSTs here periodically; the handler
/// scans every registered workflow carrying a `schedule` trigger node and
/// fire-and-forgets a live run for each cron expression that came due within
/// the last polling window. Malformed cron expressions are logged and
/// skipped, never fatal.

use crate::{
    api::workflows::{persist_run, AppState},
    workflow::types::ExecutionMode,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Poll window: a cron fire is considered due if it happened this recently.
const POLL_WINDOW_SECS: i64 = 60;

/// Scheduler state: the shared app state plus the poll auth token.
#[derive(Clone)]
pub struct SchedulerState {
    pub app_state: AppState,
    /// Bearer token required on the poll endpoint; `None` disables auth
    /// (local development only).
    pub token: Option<String>,
}

/// Create scheduler routes
pub fn create_scheduler_routes() -> Router<SchedulerState> {
    Router::new().route("/api/scheduler/run", post(run_due_schedules))
}

/// Check due cron triggers and fire runs
///
/// POST /api/scheduler/run
/// Returns: { "workflowsChecked": n, "workflowsTriggered": m }
async fn run_due_schedules(
    State(state): State<SchedulerState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let provided = bearer_token(&headers);
    check_bearer(state.token.as_deref(), provided)?;

    let now = Utc::now();
    let scheduled = state.app_state.registry.scheduled_workflows();
    let workflows_checked = scheduled.len();
    let mut workflows_triggered = 0usize;

    for (workflow_id, compiled) in scheduled {
        let due: Vec<_> = compiled
            .schedules
            .iter()
            .filter_map(|(cron_expr, node_id)| {
                due_fire_time(cron_expr, now).map(|fired_at| (cron_expr, node_id, fired_at))
            })
            .collect();
        if due.is_empty() {
            continue;
        }
        // A workflow counts once no matter how many of its schedules fired.
        workflows_triggered += 1;

        for (cron_expr, trigger_node_id, fired_at) in due {
            tracing::info!(
                workflow = %workflow_id,
                cron = %cron_expr,
                "schedule fired, spawning run"
            );

            let app_state = state.app_state.clone();
            let workflow = compiled.workflow.clone();
            let workflow_id = workflow_id.clone();
            let seed: BTreeMap<String, Value> = [(
                trigger_node_id.clone(),
                json!({
                    "triggered_at": fired_at.to_rfc3339(),
                    "cron": cron_expr,
                }),
            )]
            .into();

            tokio::spawn(async move {
                match app_state
                    .coordinator
                    .execute(&workflow, &["schedule"], ExecutionMode::Live, seed)
                    .await
                {
                    Ok(result) => {
                        if result.is_clean() {
                            tracing::info!(workflow = %workflow_id, "scheduled run completed");
                        } else {
                            tracing::warn!(
                                workflow = %workflow_id,
                                "scheduled run completed with node failures"
                            );
                        }
                        persist_run(&app_state, &workflow, &workflow_id, &result).await;
                    }
                    Err(e) => {
                        tracing::error!(workflow = %workflow_id, "scheduled run rejected: {e}");
                    }
                }
            });
        }
    }

    Ok(Json(json!({
        "workflowsChecked": workflows_checked,
        "workflowsTriggered": workflows_triggered,
    })))
}

/// The fire time if `cron_expr` came due within the poll window ending `now`.
/// Malformed expressions return `None` after a warning.
fn due_fire_time(cron_expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = match Schedule::from_str(cron_expr) {
        Ok(schedule) => schedule,
        Err(e) => {
            tracing::warn!(cron = %cron_expr, "skipping malformed cron expression: {e}");
            return None;
        }
    };
    let window_start = now - Duration::seconds(POLL_WINDOW_SECS);
    schedule
        .after(&window_start)
        .next()
        .filter(|fire| *fire <= now)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// 401 when the token is required but absent, 403 on mismatch.
fn check_bearer(expected: Option<&str>, provided: Option<&str>) -> Result<(), StatusCode> {
    match (expected, provided) {
        (None, _) => Ok(()),
        (Some(_), None) => Err(StatusCode::UNAUTHORIZED),
        (Some(want), Some(got)) if want == got => Ok(()),
        (Some(_), Some(_)) => Err(StatusCode::FORBIDDEN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bearer_decisions() {
        assert!(check_bearer(None, None).is_ok());
        assert!(check_bearer(Some("tok"), Some("tok")).is_ok());
        assert_eq!(check_bearer(Some("tok"), None), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(
            check_bearer(Some("tok"), Some("bad")),
            Err(StatusCode::FORBIDDEN)
        );
    }

    #[test]
    fn bearer_header_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc123"));
        headers.insert(axum::http::header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn every_minute_cron_is_always_due() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 30).unwrap();
        let fired = due_fire_time("0 * * * * *", now).unwrap();
        assert!(fired <= now);
        assert!(fired > now - Duration::seconds(POLL_WINDOW_SECS));
    }

    #[test]
    fn hourly_cron_is_due_only_near_the_hour() {
        let on_the_hour = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 30).unwrap();
        assert!(due_fire_time("0 0 * * * *", on_the_hour).is_some());

        let mid_hour = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 30).unwrap();
        assert!(due_fire_time("0 0 * * * *", mid_hour).is_none());
    }

    #[test]
    fn malformed_cron_is_skipped() {
        assert!(due_fire_time("not a cron", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn workflow_with_two_due_schedules_counts_once() {
        use crate::credentials::StaticCredentialResolver;
        use crate::engine::coordinator::ExecutionCoordinator;
        use crate::nodes::NodeHandlerRegistry;
        use crate::workflow::registry::WorkflowRegistry;
        use crate::workflow::storage::WorkflowStorage;
        use axum::extract::State;
        use std::sync::Arc;

        let pool = sqlx::sqlite::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let storage = WorkflowStorage::new(pool);
        storage.init_schema().await.unwrap();
        let workflow = serde_json::from_value(json!({
            "name": "doubly-scheduled",
            "nodes": [
                {"id": "s1", "type": "schedule", "config": {"cron": "0 * * * * *"}},
                {"id": "s2", "type": "schedule", "config": {"cron": "0 * * * * *"}}
            ],
            "connections": []
        }))
        .unwrap();
        storage.save_workflow("wf", &workflow).await.unwrap();

        let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
        registry.init_from_storage().await.unwrap();
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::new(NodeHandlerRegistry::builtin(reqwest::Client::new())),
            Arc::new(StaticCredentialResolver::default()),
            registry.clone(),
            reqwest::Client::new(),
            100,
        ));
        let state = SchedulerState {
            app_state: AppState {
                storage,
                registry,
                coordinator,
            },
            token: None,
        };

        let Json(body) = run_due_schedules(State(state), HeaderMap::new()).await.unwrap();
        assert_eq!(body["workflowsChecked"], 1);
        assert_eq!(body["workflowsTriggered"], 1);
    }
}
