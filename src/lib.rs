/// Strandway: workflow execution engine for no-code automations
///
/// This library provides a resolve-then-dispatch workflow engine with
/// placeholder resolution, deterministic DAG ordering, control-flow node
/// interpreters, and webhook/scheduler trigger adapters.

// Core configuration and setup
pub mod config;

// Credential resolution (database-backed with environment fallback)
pub mod credentials;

// Structural and node-level error taxonomy
pub mod error;

// Workflow management layer: definitions, storage, hot-reload registry
pub mod workflow;

// Execution engine: graph analysis, resolver, coordinator, control flow
pub mod engine;

// Node handler implementations (triggers, transforms, external services)
pub mod nodes;

// HTTP API layer: workflow CRUD, webhooks, scheduler poll
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use engine::coordinator::ExecutionCoordinator;
pub use error::{NodeError, WorkflowError};
pub use server::start_server;
pub use workflow::types::{ExecutionMode, Workflow, WorkflowExecutionResult};
