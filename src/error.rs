//! Error types for the lab control plane.

use std::time::Duration;
use thiserror::Error;

/// Errors raised at the orchestration-cluster boundary.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("cluster API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("cluster transport: {0}")]
    Transport(String),

    #[error("cluster config: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClusterError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Errors surfaced by the sandbox lifecycle and interaction engine.
#[derive(Debug, Error)]
pub enum LabError {
    #[error("template {0} not found")]
    TemplateNotFound(String),

    #[error("no sandbox found for user {0}")]
    SandboxNotFound(String),

    #[error("workload {namespace}/{name} not found")]
    WorkloadNotFound { namespace: String, name: String },

    #[error("sandbox {namespace}/{name} is not ready: {reason}")]
    SandboxNotReady {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("command timed out after {}s", .0.as_secs())]
    ExecutionTimeout(Duration),

    #[error("task index {index} out of range for template {template}")]
    InvalidTaskIndex { template: String, index: usize },

    #[error("{step}: {source}")]
    Infrastructure {
        step: &'static str,
        #[source]
        source: ClusterError,
    },
}

impl LabError {
    /// Wrap a cluster error with the name of the step that produced it.
    pub fn at(step: &'static str) -> impl FnOnce(ClusterError) -> LabError {
        move |source| LabError::Infrastructure { step, source }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            LabError::TemplateNotFound(_)
            | LabError::SandboxNotFound(_)
            | LabError::WorkloadNotFound { .. } => true,
            LabError::Infrastructure { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Result type for lab operations.
pub type Result<T> = std::result::Result<T, LabError>;
