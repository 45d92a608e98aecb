//! The orchestration-cluster boundary.
//!
//! Everything the control plane does to the cluster goes through [`Cluster`].
//! [`KubeClient`] is the production implementation; tests substitute an
//! in-memory fake.

mod kube;
pub mod protocol;
pub mod types;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ClusterError;

pub use kube::{ClusterCredentials, KubeClient};
pub use types::{
    ConfigMap, Container, DeleteOptions, Namespace, ObjectMeta, Pod, PodPhase, PodSpec,
};

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    pub const DEFAULT: TerminalSize = TerminalSize {
        width: 80,
        height: 24,
    };
}

/// Parameters of a remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub command: Vec<String>,
    pub container: Option<String>,
    pub stdin: bool,
    pub tty: bool,
}

/// Sent into a running command.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecInput {
    Stdin(Bytes),
    Resize(TerminalSize),
}

/// Produced by a running command.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// Final event of a stream.
    Exit(ExitStatus),
}

/// How a remote command finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub message: Option<String>,
}

impl ExitStatus {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            message: None,
        }
    }

    pub fn failure(code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0) && self.message.is_none()
    }
}

/// Both halves of a remote command stream.
///
/// Dropping `input` closes the command's stdin. `events` ends with exactly
/// one [`ExecEvent::Exit`] unless the transport fails first.
pub struct ExecChannel {
    pub input: mpsc::Sender<ExecInput>,
    pub events: mpsc::Receiver<ExecEvent>,
}

#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<Namespace>;
    async fn list_namespaces(&self, selector: Option<&str>) -> ClusterResult<Vec<Namespace>>;
    async fn delete_namespace(&self, name: &str, options: &DeleteOptions) -> ClusterResult<()>;

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> ClusterResult<ConfigMap>;
    async fn list_config_maps(&self, namespace: &str, selector: &str)
        -> ClusterResult<Vec<ConfigMap>>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<Pod>;
    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod>;
    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> ClusterResult<Vec<Pod>>;
    async fn delete_pod(&self, namespace: &str, name: &str, options: &DeleteOptions)
        -> ClusterResult<()>;

    /// Start `options.command` inside a pod and return its stream.
    async fn exec(&self, namespace: &str, pod: &str, options: &ExecOptions)
        -> ClusterResult<ExecChannel>;
}
