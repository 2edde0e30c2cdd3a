/// In-memory workflow registry with lock-free reads.
///
/// Workflows are compiled once on save: webhook paths and cron schedules
/// are extracted from trigger nodes so the routing hot paths never walk
/// node lists. `ArcSwap` gives wait-free reads with atomic whole-map
/// replacement on reload.

use crate::engine::coordinator::WorkflowFinder;
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::Workflow;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A workflow plus the trigger metadata extracted from its definition.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Arc<Workflow>,
    /// (path suffix, trigger node id) pairs from webhookTrigger nodes.
    pub webhook_paths: Vec<(String, String)>,
    /// (cron expression, trigger node id) pairs from schedule nodes.
    pub schedules: Vec<(String, String)>,
}

impl CompiledWorkflow {
    pub fn compile(workflow: Workflow) -> Self {
        let mut webhook_paths = Vec::new();
        let mut schedules = Vec::new();
        for node in &workflow.nodes {
            match node.node_type.as_str() {
                "webhookTrigger" => {
                    if let Some(suffix) = node.config.get("pathSuffix").and_then(|v| v.as_str()) {
                        webhook_paths.push((suffix.trim_matches('/').to_string(), node.id.clone()));
                    }
                }
                "schedule" => {
                    if let Some(cron) = node.config.get("cron").and_then(|v| v.as_str()) {
                        schedules.push((cron.to_string(), node.id.clone()));
                    }
                }
                _ => {}
            }
        }
        Self {
            workflow: Arc::new(workflow),
            webhook_paths,
            schedules,
        }
    }
}

/// Registry of compiled workflows, keyed by workflow id.
pub struct WorkflowRegistry {
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    storage: WorkflowStorage,
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::from_pointee(HashMap::new()),
            storage,
        }
    }

    /// Load and compile every stored workflow. Called once at startup.
    pub async fn init_from_storage(&self) -> anyhow::Result<()> {
        let stored = self.storage.load_all_workflows().await?;
        let mut compiled = HashMap::with_capacity(stored.len());
        for (id, workflow) in stored {
            compiled.insert(id, CompiledWorkflow::compile(workflow));
        }
        tracing::info!(count = compiled.len(), "workflow registry initialized");
        self.workflows.store(Arc::new(compiled));
        Ok(())
    }

    /// Recompile one workflow from storage after a save.
    pub async fn reload_workflow(&self, id: &str) -> anyhow::Result<()> {
        let Some(workflow) = self.storage.get_workflow(id).await? else {
            anyhow::bail!("workflow '{id}' not found in storage");
        };
        let mut updated = (**self.workflows.load()).clone();
        updated.insert(id.to_string(), CompiledWorkflow::compile(workflow));
        self.workflows.store(Arc::new(updated));
        Ok(())
    }

    pub fn remove_workflow(&self, id: &str) {
        let mut updated = (**self.workflows.load()).clone();
        if updated.remove(id).is_some() {
            self.workflows.store(Arc::new(updated));
        }
    }

    pub fn get_workflow(&self, id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(id).cloned()
    }

    /// Match an incoming webhook path suffix against registered triggers.
    /// Returns (workflow id, compiled workflow, trigger node id).
    pub fn find_by_webhook_path(&self, path: &str) -> Option<(String, CompiledWorkflow, String)> {
        let path = path.trim_matches('/');
        let workflows = self.workflows.load();
        for (id, compiled) in workflows.iter() {
            for (suffix, node_id) in &compiled.webhook_paths {
                if suffix == path {
                    return Some((id.clone(), compiled.clone(), node_id.clone()));
                }
            }
        }
        None
    }

    /// All workflows that carry at least one schedule trigger.
    pub fn scheduled_workflows(&self) -> Vec<(String, CompiledWorkflow)> {
        self.workflows
            .load()
            .iter()
            .filter(|(_, c)| !c.schedules.is_empty())
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect()
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.workflows.load().keys().cloned().collect()
    }
}

/// Lets `callExternalWorkflow` nodes look up sibling workflows by name or id.
#[async_trait]
impl WorkflowFinder for WorkflowRegistry {
    async fn find(&self, name: &str) -> Option<Workflow> {
        let workflows = self.workflows.load();
        if let Some(compiled) = workflows.get(name) {
            return Some((*compiled.workflow).clone());
        }
        workflows
            .values()
            .find(|c| c.workflow.name.as_deref() == Some(name))
            .map(|c| (*c.workflow).clone())
    }
}
