//! Typed error hierarchy for the workflow engine.
//!
//! Three enums cover the engine's failure surfaces:
//! - `GraphValidationError`: a workflow graph that cannot be compiled
//! - `CapabilityError`: any plugin or LLM failure while executing a node
//! - `EngineError`: everything the run/task operations report to callers

use thiserror::Error;

/// Errors raised while compiling a workflow graph into an execution order.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphValidationError {
    #[error("Workflow must contain at least one node")]
    EmptyGraph,

    #[error("Duplicate node id: {id}")]
    DuplicateNode { id: String },

    #[error("Missing required agent role(s): {}", roles.join(", "))]
    MissingRequiredRole { roles: Vec<String> },

    #[error("Cycle detected in workflow graph. Involved nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },
}

/// Uniform wrapper for anything that goes wrong inside a capability.
///
/// Carries the role that was being executed and the original message; the
/// retry layer only ever sees this type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Capability '{role}' failed: {message}")]
pub struct CapabilityError {
    pub role: String,
    pub message: String,
}

impl CapabilityError {
    pub fn new(role: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            message: message.into(),
        }
    }
}

/// Errors from the run and task operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid workflow: {0}")]
    Graph(#[from] GraphValidationError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Task {task_id} failed permanently after {attempts} retries: {last_error}")]
    RetryExhausted {
        task_id: i64,
        attempts: u32,
        last_error: String,
    },

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("No workflow defined for project {project_id}")]
    WorkflowNotFound { project_id: i64 },

    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Task {task_id} is already running")]
    ConcurrentModification { task_id: i64 },

    #[error("Run {run_id} is already running")]
    RunAlreadyRunning { run_id: i64 },

    #[error("Run {run_id} was superseded by run {newer_run_id}")]
    RunSuperseded { run_id: i64, newer_run_id: i64 },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: i64,
        from: String,
        to: String,
    },

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_role_names_every_absent_role() {
        let err = GraphValidationError::MissingRequiredRole {
            roles: vec!["PG".to_string(), "QA".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("PG"));
        assert!(msg.contains("QA"));
    }

    #[test]
    fn cycle_detected_lists_nodes() {
        let err = GraphValidationError::CycleDetected {
            nodes: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn capability_error_keeps_original_message() {
        let err = CapabilityError::new("PG", "model returned 503");
        assert_eq!(err.role, "PG");
        assert!(err.to_string().contains("model returned 503"));
    }

    #[test]
    fn engine_error_converts_from_graph_error() {
        let err: EngineError = GraphValidationError::EmptyGraph.into();
        match &err {
            EngineError::Graph(GraphValidationError::EmptyGraph) => {}
            _ => panic!("Expected EngineError::Graph(EmptyGraph)"),
        }
        assert!(err.to_string().contains("at least one node"));
    }

    #[test]
    fn concurrent_modification_carries_task_id() {
        let err = EngineError::ConcurrentModification { task_id: 7 };
        assert!(matches!(err, EngineError::ConcurrentModification { task_id: 7 }));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn retry_exhausted_reports_last_error() {
        let err = EngineError::RetryExhausted {
            task_id: 3,
            attempts: 3,
            last_error: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("after 3 retries"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GraphValidationError::EmptyGraph);
        assert_std_error(&CapabilityError::new("QA", "x"));
        assert_std_error(&EngineError::RunNotFound { id: 1 });
    }
}
