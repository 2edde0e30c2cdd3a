/// SQLite persistence layer.
///
/// Workflows, credentials, and run history live in one SQLite database.
/// Definitions and run results are stored as JSON columns for flexibility
/// while keeping indexed lookup fields for the hot paths.

use crate::workflow::types::{RunStatus, Workflow, WorkflowRunRecord};
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;

/// SQLite-backed storage for workflow definitions, credentials and runs.
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the schema. Safe to call multiple times (IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflows_name
            ON workflows(name)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                result JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflow_runs_name
            ON workflow_runs(workflow_name)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store a new workflow or update an existing one (atomic UPSERT).
    pub async fn save_workflow(&self, id: &str, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;
        let name = workflow.name.clone().unwrap_or_else(|| id.to_string());

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(id)
        .bind(&name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List all workflows with basic metadata.
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, created_at, updated_at FROM workflows ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowMetadata {
                id: row.get("id"),
                name: row.get("name"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Load all workflows for registry initialization.
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, Workflow>> {
        let rows = sqlx::query("SELECT id, definition FROM workflows")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            workflows.insert(id, serde_json::from_str(&definition_json)?);
        }
        Ok(workflows)
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store or replace a credential value. The value is write-only from the
    /// API's perspective; it is only ever read by the credential resolver.
    pub async fn set_credential(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (name, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(name) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_credential_value(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM credentials WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Credential names only; values never leave the resolver path.
    pub async fn list_credential_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM credentials ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    pub async fn delete_credential(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist one run record (webhook, scheduler, or run-now execution).
    pub async fn record_run(&self, record: &WorkflowRunRecord) -> Result<()> {
        let result_json = serde_json::to_string(&record.result)?;
        let status = match record.status {
            RunStatus::Success => "Success",
            RunStatus::Failed => "Failed",
        };

        sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_name, status, result, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workflow_name)
        .bind(status)
        .bind(&result_json)
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs, optionally filtered to one workflow.
    pub async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<WorkflowRunRecord>> {
        let rows = match workflow_name {
            Some(name) => {
                sqlx::query(
                    r#"
                    SELECT id, workflow_name, status, result, created_at
                    FROM workflow_runs WHERE workflow_name = ?
                    ORDER BY created_at DESC LIMIT ?
                    "#,
                )
                .bind(name)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, workflow_name, status, result, created_at
                    FROM workflow_runs ORDER BY created_at DESC LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let result_json: String = row.get("result");
            let created_at: String = row.get("created_at");
            records.push(WorkflowRunRecord {
                id: row.get("id"),
                workflow_name: row.get("workflow_name"),
                timestamp: created_at
                    .parse()
                    .unwrap_or_else(|_| chrono::Utc::now()),
                status: if status == "Success" {
                    RunStatus::Success
                } else {
                    RunStatus::Failed
                },
                result: serde_json::from_str(&result_json)?,
            });
        }
        Ok(records)
    }
}

/// Basic workflow metadata for listing operations.
#[derive(Debug, serde::Serialize)]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}
