//! Runtime configuration, constructed once in `main` and shared by reference.

use std::path::PathBuf;
use std::time::Duration;

/// Label applied to every sandbox workload.
pub const LAB_APP_LABEL: &str = "girus-lab";
/// Config map holding the rendered lab content.
pub const LAB_FILES_CONFIG_MAP: &str = "lab-files";
pub const LAB_FILES_MOUNT: &str = "/lab-files";
pub const SCRIPTS_MOUNT: &str = "/scripts";

/// CPU and memory requests/limits for a sandbox workload.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_request: "200m".to_string(),
            memory_request: "512Mi".to_string(),
            cpu_limit: "500m".to_string(),
            memory_limit: "1Gi".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Explicit kubeconfig path; `None` means in-cluster first, then the usual fallbacks.
    pub kubeconfig: Option<PathBuf>,

    pub default_image: String,
    pub kubernetes_image: String,
    pub docker_image: String,
    pub cloud_image: String,

    pub templates_namespace: String,
    pub template_selector: String,

    pub namespace_prefix: String,
    pub workload_prefix: String,
    pub container_name: String,
    pub shell: String,
    pub resources: ResourceConfig,

    pub exec_timeout: Duration,
    pub monitor_interval: Duration,
    /// Pause after deleting a previous workload before creating its replacement.
    pub replace_wait: Duration,
    pub keepalive_interval: Duration,
    pub default_max_duration: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            kubeconfig: None,
            default_image: "ubuntu:latest".to_string(),
            kubernetes_image: "linuxtips/girus-kind-multi-node:0.1".to_string(),
            docker_image: "linuxtips/girus-devops:0.1".to_string(),
            cloud_image: "linuxtips/girus-localstack:0.1".to_string(),
            templates_namespace: "girus".to_string(),
            template_selector: "app=girus-lab-template".to_string(),
            namespace_prefix: "lab-".to_string(),
            workload_prefix: "lab".to_string(),
            container_name: "lab".to_string(),
            shell: "/bin/bash".to_string(),
            resources: ResourceConfig::default(),
            exec_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
            replace_wait: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(15),
            default_max_duration: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    /// Namespace owning a user's sandbox.
    pub fn namespace_for(&self, user_id: &str) -> String {
        format!("{}{}", self.namespace_prefix, user_id)
    }

    /// Inverse of [`Config::namespace_for`]; `None` for foreign namespaces.
    pub fn user_for_namespace<'a>(&self, namespace: &'a str) -> Option<&'a str> {
        namespace
            .strip_prefix(self.namespace_prefix.as_str())
            .filter(|user| !user.is_empty())
    }
}
