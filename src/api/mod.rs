/// HTTP API layer
///
/// REST endpoints for workflow management, run-now execution, credential
/// management, webhook triggers, and the scheduler poll endpoint.

// Workflow CRUD, run-now, run history, credentials
pub mod workflows;

// Inbound webhook trigger endpoint
pub mod webhooks;

// Scheduler poll endpoint
pub mod scheduler;

pub use scheduler::create_scheduler_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::create_workflow_routes;
