//! Sandbox Provisioner: creates, replaces, describes and tears down sandboxes.
//!
//! This is the only component that writes sandbox infrastructure.

pub mod content;
pub mod workload;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterResult, ConfigMap, DeleteOptions, Pod, PodPhase};
use crate::config::Config;
use crate::error::{ClusterError, LabError, Result};
use crate::identity::{self, SandboxRef};
use crate::index::{SandboxEntry, SandboxIndex};
use crate::template::{LabTemplate, TemplateCatalog};

/// Grace period for a non-forced teardown.
const GRACEFUL_DELETE_SECS: i64 = 30;

/// Point-in-time view of a user's sandbox. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabInfo {
    pub namespace: String,
    pub pod_name: String,
    pub template_id: String,
    pub status: PodPhase,
    pub all_containers_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube_video: Option<String>,
    pub timer_enabled: bool,
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    /// Whole seconds left before expiration, never negative.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<i64>,
}

impl LabInfo {
    /// Derive the view of `pod` at instant `now`.
    ///
    /// `template` may be missing when the template was removed from the catalog
    /// after the sandbox was created; the timer is then disabled.
    pub fn from_pod(
        namespace: &str,
        pod: &Pod,
        template: Option<&LabTemplate>,
        default_lifetime: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let template_id = pod.label("template").unwrap_or_default().to_string();
        let start_time = pod.metadata.creation_timestamp;
        let timer_enabled = template.map(|t| t.timer_enabled).unwrap_or(false);

        let expiration_time = match (timer_enabled, template, start_time) {
            (true, Some(t), Some(start)) => chrono::Duration::from_std(t.lifetime_or(default_lifetime))
                .ok()
                .and_then(|lifetime| start.checked_add_signed(lifetime)),
            _ => None,
        };
        let remaining_time = expiration_time.map(|exp| (exp - now).num_seconds().max(0));

        Self {
            namespace: namespace.to_string(),
            pod_name: pod.name().to_string(),
            template_id,
            status: pod.phase(),
            all_containers_ready: pod.all_containers_ready(),
            youtube_video: template.and_then(|t| t.youtube_video.clone()),
            timer_enabled,
            start_time,
            expiration_time,
            remaining_time,
        }
    }

    /// Whether the timer policy says this sandbox is past its lifetime.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timer_enabled && self.expiration_time.map(|exp| now > exp).unwrap_or(false)
    }

    pub fn sandbox_ref(&self) -> SandboxRef {
        SandboxRef::new(&self.namespace, &self.pod_name)
    }
}

/// Newest pod by creation time.
fn newest(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter().max_by_key(|p| p.metadata.creation_timestamp)
}

fn tolerate_not_found(result: ClusterResult<()>) -> ClusterResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

pub struct Provisioner {
    cluster: Arc<dyn Cluster>,
    catalog: Arc<TemplateCatalog>,
    index: Arc<dyn SandboxIndex>,
    config: Arc<Config>,
}

impl Provisioner {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        catalog: Arc<TemplateCatalog>,
        index: Arc<dyn SandboxIndex>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cluster,
            catalog,
            index,
            config,
        }
    }

    /// Create or replace the sandbox of `user_id` running `template_id`.
    pub async fn provision(&self, user_id: &str, template_id: &str) -> Result<SandboxEntry> {
        let template = self
            .catalog
            .get(template_id)
            .await
            .ok_or_else(|| LabError::TemplateNotFound(template_id.to_string()))?;

        let namespace = self.config.namespace_for(user_id);
        let name = identity::workload_name(&self.config.workload_prefix, user_id);
        info!(user_id, template = template_id, namespace = %namespace, workload = %name, "Provisioning sandbox");

        self.ensure_namespace(&namespace, user_id).await?;
        // Unindexed until the replacement exists, so a failure below leaves no stale entry.
        if let Some(stale) = self.index.delete(user_id).await {
            debug!(user_id, workload = %stale.workload, "Dropped index entry of the replaced sandbox");
        }
        self.remove_previous_workloads(&namespace).await?;

        self.replace_config_map(&namespace, workload::lab_files(&namespace, &template))
            .await
            .map_err(LabError::at("create lab content"))?;
        if let Some(script) = content::init_script(template.family) {
            self.replace_config_map(&namespace, workload::init_script_map(&namespace, &script))
                .await
                .map_err(LabError::at("create init script"))?;
        }

        let pod = workload::pod(&self.config, &namespace, &name, user_id, &template);
        self.cluster
            .create_pod(&namespace, &pod)
            .await
            .map_err(LabError::at("create workload"))?;

        let entry = SandboxEntry {
            namespace,
            workload: name,
            template_id: template_id.to_string(),
        };
        self.index.put(user_id, entry.clone()).await;
        info!(user_id, namespace = %entry.namespace, workload = %entry.workload, "Sandbox provisioned");
        Ok(entry)
    }

    async fn ensure_namespace(&self, namespace: &str, user_id: &str) -> Result<()> {
        match self
            .cluster
            .create_namespace(&workload::namespace(namespace, user_id))
            .await
        {
            Ok(_) => {
                debug!(namespace, "Namespace created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(LabError::at("create namespace")(e)),
        }
    }

    /// Delete every lab workload left in `namespace`, then pause for the
    /// configured interval. Deletion is not awaited to completion.
    async fn remove_previous_workloads(&self, namespace: &str) -> Result<()> {
        let previous = self
            .cluster
            .list_pods(namespace, Some(&workload::lab_selector()))
            .await
            .map_err(LabError::at("list previous workloads"))?;
        if previous.is_empty() {
            return Ok(());
        }

        for pod in &previous {
            tolerate_not_found(
                self.cluster
                    .delete_pod(namespace, pod.name(), &DeleteOptions::immediate())
                    .await,
            )
            .map_err(LabError::at("delete previous workload"))?;
            info!(namespace, workload = pod.name(), "Replaced previous workload");
        }
        tokio::time::sleep(self.config.replace_wait).await;
        Ok(())
    }

    async fn replace_config_map(&self, namespace: &str, config_map: ConfigMap) -> ClusterResult<()> {
        tolerate_not_found(
            self.cluster
                .delete_config_map(namespace, &config_map.metadata.name)
                .await,
        )?;
        self.cluster
            .create_config_map(namespace, &config_map)
            .await
            .map(|_| ())
    }

    /// Remove the sandbox of `user_id`.
    ///
    /// The index entry is dropped first and stays dropped whatever the
    /// deletions below return. An expired sandbox is always deleted at once.
    pub async fn teardown(&self, user_id: &str, force: bool) -> Result<()> {
        let entry = self
            .index
            .delete(user_id)
            .await
            .ok_or_else(|| LabError::SandboxNotFound(user_id.to_string()))?;

        let mut force = force;
        if !force {
            if let Some(info) = self.describe(&entry.namespace, &entry.workload, Utc::now()).await {
                if info.is_expired(Utc::now()) {
                    info!(user_id, workload = %entry.workload, "Sandbox already expired, forcing deletion");
                    force = true;
                }
            }
        }
        let grace = if force { 0 } else { GRACEFUL_DELETE_SECS };

        let workload_result = tolerate_not_found(
            self.cluster
                .delete_pod(&entry.namespace, &entry.workload, &DeleteOptions::with_grace(grace))
                .await,
        );
        if let Err(e) = &workload_result {
            warn!(user_id, workload = %entry.workload, "Failed to delete workload: {}", e);
        }

        if let Err(e) = tolerate_not_found(
            self.cluster
                .delete_namespace(&entry.namespace, &DeleteOptions::with_grace(grace))
                .await,
        ) {
            warn!(user_id, namespace = %entry.namespace, "Failed to delete namespace: {}", e);
        }

        workload_result.map_err(LabError::at("delete workload"))?;
        info!(user_id, namespace = %entry.namespace, force, "Sandbox torn down");
        Ok(())
    }

    /// LabInfo for one workload, or `None` if it cannot be read.
    async fn describe(&self, namespace: &str, workload: &str, now: DateTime<Utc>) -> Option<LabInfo> {
        let pod = self.cluster.get_pod(namespace, workload).await.ok()?;
        Some(self.lab_info(namespace, &pod, now).await)
    }

    async fn lab_info(&self, namespace: &str, pod: &Pod, now: DateTime<Utc>) -> LabInfo {
        let template = match pod.label("template") {
            Some(id) => self.catalog.get(id).await,
            None => None,
        };
        LabInfo::from_pod(
            namespace,
            pod,
            template.as_deref(),
            self.config.default_max_duration,
            now,
        )
    }

    /// Current sandbox of `user_id` at instant `now`.
    ///
    /// The indexed workload wins when it is still present; otherwise the
    /// newest lab workload of the user's namespace is reported.
    pub async fn sandbox_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<Option<LabInfo>> {
        let namespace = self.config.namespace_for(user_id);
        let pods = match self
            .cluster
            .list_pods(&namespace, Some(&workload::lab_selector()))
            .await
        {
            Ok(pods) => pods,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(LabError::at("list workloads")(e)),
        };

        let indexed = self.index.get(user_id).await.map(|e| e.workload);
        let pod = match indexed {
            Some(name) if pods.iter().any(|p| p.name() == name) => {
                pods.into_iter().find(|p| p.name() == name)
            }
            _ => newest(pods),
        };

        match pod {
            Some(pod) => Ok(Some(self.lab_info(&namespace, &pod, now).await)),
            None => Ok(None),
        }
    }

    pub async fn current_sandbox(&self, user_id: &str) -> Result<Option<LabInfo>> {
        self.sandbox_at(user_id, Utc::now()).await
    }

    /// Read a workload by coordinates.
    pub async fn workload_status(&self, target: &SandboxRef) -> Result<Pod> {
        self.cluster
            .get_pod(&target.namespace, &target.workload)
            .await
            .map_err(|e| match e {
                ClusterError::NotFound { .. } => LabError::WorkloadNotFound {
                    namespace: target.namespace.clone(),
                    name: target.workload.clone(),
                },
                other => LabError::at("get workload")(other),
            })
    }

    /// Users that own a sandbox namespace on the cluster.
    pub async fn sandbox_users(&self) -> Result<Vec<String>> {
        let namespaces = self
            .cluster
            .list_namespaces(None)
            .await
            .map_err(LabError::at("list namespaces"))?;
        Ok(namespaces
            .iter()
            .filter_map(|ns| self.config.user_for_namespace(&ns.metadata.name))
            .map(str::to_string)
            .collect())
    }

    /// Force-delete the workloads of `namespace` that are expired at `now`.
    ///
    /// A replacement created since the scan is left alone, and so is its index
    /// entry: only entries pointing at a removed workload are dropped.
    /// Individual deletion failures are logged. Returns how many workloads were removed.
    pub async fn reclaim(&self, user_id: &str, namespace: &str, now: DateTime<Utc>) -> Result<usize> {
        let pods = self
            .cluster
            .list_pods(namespace, Some(&workload::lab_selector()))
            .await
            .map_err(LabError::at("list workloads"))?;

        let mut removed = 0;
        for pod in &pods {
            if !self.lab_info(namespace, pod, now).await.is_expired(now) {
                debug!(user_id, namespace, workload = pod.name(), "Workload within its lifetime, keeping it");
                continue;
            }
            match tolerate_not_found(
                self.cluster
                    .delete_pod(namespace, pod.name(), &DeleteOptions::immediate())
                    .await,
            ) {
                Ok(()) => {
                    removed += 1;
                    self.index.delete_if(user_id, pod.name()).await;
                }
                Err(e) => warn!(user_id, namespace, workload = pod.name(), "Failed to delete expired workload: {}", e),
            }
        }

        info!(user_id, namespace, removed, "Expired sandbox reclaimed");
        Ok(removed)
    }

    /// Repopulate the index from the workloads present on the cluster.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut restored = 0;
        for user_id in self.sandbox_users().await? {
            let namespace = self.config.namespace_for(&user_id);
            let pods = match self
                .cluster
                .list_pods(&namespace, Some(&workload::lab_selector()))
                .await
            {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(user_id = %user_id, "Skipping sandbox during index rebuild: {}", e);
                    continue;
                }
            };
            if let Some(pod) = newest(pods) {
                let entry = SandboxEntry {
                    namespace,
                    workload: pod.name().to_string(),
                    template_id: pod.label("template").unwrap_or_default().to_string(),
                };
                self.index.put(&user_id, entry).await;
                restored += 1;
            }
        }
        info!("Restored {} sandboxes into the index", restored);
        Ok(restored)
    }
}
