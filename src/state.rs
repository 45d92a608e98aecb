//! Shared application state.

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::exec::Executor;
use crate::index::SandboxIndex;
use crate::monitor::ExpirationMonitor;
use crate::provisioner::Provisioner;
use crate::template::TemplateCatalog;
use crate::terminal::TerminalBridge;
use crate::validation::ValidationEngine;

/// Components shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<TemplateCatalog>,
    pub provisioner: Arc<Provisioner>,
    pub executor: Arc<Executor>,
    pub validation: Arc<ValidationEngine>,
    pub terminal: Arc<TerminalBridge>,
}

impl AppState {
    /// Wire all components around one cluster, catalog and index.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        catalog: Arc<TemplateCatalog>,
        index: Arc<dyn SandboxIndex>,
        config: Arc<Config>,
    ) -> Self {
        let executor = Arc::new(Executor::new(cluster.clone(), config.clone()));
        let provisioner = Arc::new(Provisioner::new(
            cluster,
            catalog.clone(),
            index,
            config.clone(),
        ));
        let validation = Arc::new(ValidationEngine::new(executor.clone(), catalog.clone()));
        let terminal = Arc::new(TerminalBridge::new(
            executor.clone(),
            config.keepalive_interval,
        ));
        Self {
            config,
            catalog,
            provisioner,
            executor,
            validation,
            terminal,
        }
    }

    pub fn expiration_monitor(&self) -> ExpirationMonitor {
        ExpirationMonitor::new(self.provisioner.clone(), self.config.monitor_interval)
    }
}
