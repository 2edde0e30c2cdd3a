//! Error taxonomy: structural failures abort a run before any node executes;
//! node-level failures stay contained to their node and feed the retry and
//! error-handle machinery.

use thiserror::Error;

/// Structural and infrastructure failures. Raised before execution starts;
/// never used for a single node's runtime failure.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    #[error("connection '{connection_id}' references unknown node '{node_id}'")]
    DanglingConnection {
        connection_id: String,
        node_id: String,
    },

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("node '{node_id}' receives more than one edge on port '{port}'")]
    PortConflict { node_id: String, port: String },

    #[error("no trigger node found for this invocation")]
    NoTriggerFound,

    #[error("ambiguous trigger: multiple candidate nodes ({0})")]
    MultipleTriggerNodes(String),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
}

/// A single node's runtime failure. Contained to the node: retried per
/// policy, then routed to the `error` handle or left terminal.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("external service error: {0}")]
    External(String),

    #[error("loop exceeded the iteration cap of {0}")]
    LoopLimitExceeded(usize),

    #[error("sub-flow failed: {0}")]
    SubFlow(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NodeError::Timeout(e.to_string())
        } else {
            NodeError::Http(e.to_string())
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_display() {
        let e = WorkflowError::DanglingConnection {
            connection_id: "c9".into(),
            node_id: "ghost".into(),
        };
        assert!(e.to_string().contains("c9"));
        assert!(e.to_string().contains("ghost"));

        let e = WorkflowError::PortConflict {
            node_id: "n2".into(),
            port: "input".into(),
        };
        assert!(e.to_string().contains("n2"));
    }

    #[test]
    fn node_errors_display() {
        assert_eq!(
            NodeError::LoopLimitExceeded(100).to_string(),
            "loop exceeded the iteration cap of 100"
        );
        assert!(NodeError::UnknownNodeType("mystery".into())
            .to_string()
            .contains("mystery"));
    }
}
