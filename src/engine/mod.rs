/// Execution engine: graph analysis, placeholder resolution, and the
/// coordinator that walks a workflow node by node.
pub mod control_flow;
pub mod coordinator;
pub mod graph;
pub mod resolver;
