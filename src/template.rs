//! Lab templates and the catalog that serves them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::error::ClusterError;

/// Complete definition of a lab. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabTemplate {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub timer_enabled: bool,
    /// Raw lifetime policy, e.g. "30m" or "1h30m".
    #[serde(default)]
    pub max_duration: String,

    #[serde(skip_deserializing, default)]
    pub family: SandboxFamily,
    #[serde(skip)]
    pub lifetime: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tips: Vec<Tip>,
    #[serde(default, rename = "validation")]
    pub validators: Vec<Validator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tip {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

/// A probe command and the output it must print.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub command: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub error_message: String,
}

/// Kind of sandbox a template needs, which fixes its image, entry command and init script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxFamily {
    Kubernetes,
    Docker,
    CloudEmulation,
    #[default]
    Generic,
}

impl SandboxFamily {
    /// Family of a template by name. Only the Kubernetes match is case-sensitive.
    pub fn classify(template_name: &str) -> Self {
        let name = template_name.to_lowercase();
        if template_name.contains("kubernetes") {
            SandboxFamily::Kubernetes
        } else if name.contains("docker") {
            SandboxFamily::Docker
        } else if name.contains("aws") || name.contains("localstack") {
            SandboxFamily::CloudEmulation
        } else {
            SandboxFamily::Generic
        }
    }
}

impl LabTemplate {
    /// Resolve the derived fields. Called once when a template enters the catalog.
    pub fn resolved(mut self) -> Self {
        self.family = SandboxFamily::classify(&self.name);
        self.lifetime = if self.max_duration.trim().is_empty() {
            None
        } else {
            match parse_duration(&self.max_duration) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(template = %self.name, max_duration = %self.max_duration, "invalid maxDuration: {}", e);
                    None
                }
            }
        };
        self
    }

    /// Maximum lifetime of a sandbox built from this template.
    pub fn lifetime_or(&self, default: Duration) -> Duration {
        self.lifetime.unwrap_or(default)
    }
}

/// Parse a duration such as "90s", "30m", "1h30m" or "1.5h".
///
/// Units: ns, us (or µs), ms, s, m, h. A bare "0" is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {:?}", input));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {:?}", input))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration {:?}", input)),
            other => return Err(format!("unknown unit {:?} in duration {:?}", other, input)),
        };
        total += value * seconds_per_unit;
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(total).map_err(|e| format!("duration {:?} out of range: {}", input, e))
}

/// Parse every template found in one config map entry. Non-YAML keys yield nothing.
pub fn parse_template_entry(key: &str, content: &str) -> Result<Option<LabTemplate>, serde_yaml::Error> {
    if !(key.ends_with(".yaml") || key.ends_with(".yml")) {
        return Ok(None);
    }
    let template: LabTemplate = serde_yaml::from_str(content)?;
    Ok(Some(template.resolved()))
}

/// Read-mostly catalog of lab templates keyed by name.
#[derive(Default)]
pub struct TemplateCatalog {
    templates: RwLock<HashMap<String, Arc<LabTemplate>>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: impl IntoIterator<Item = LabTemplate>) -> Self {
        let map = templates
            .into_iter()
            .map(|t| {
                let t = t.resolved();
                (t.name.clone(), Arc::new(t))
            })
            .collect();
        Self {
            templates: RwLock::new(map),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<LabTemplate>> {
        self.templates.read().await.get(name).cloned()
    }

    /// All templates, ordered by name.
    pub async fn list(&self) -> Vec<Arc<LabTemplate>> {
        let mut list: Vec<_> = self.templates.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Swap the whole catalog for a new set of templates.
    pub async fn replace_all(&self, templates: Vec<LabTemplate>) {
        let map: HashMap<_, _> = templates
            .into_iter()
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        *self.templates.write().await = map;
    }

    /// Load templates from the config maps matching `selector` in `namespace`.
    ///
    /// Entries that fail to parse are logged and skipped. Returns the number loaded.
    pub async fn load_from_cluster(
        &self,
        cluster: &dyn Cluster,
        namespace: &str,
        selector: &str,
    ) -> Result<usize, ClusterError> {
        let config_maps = cluster.list_config_maps(namespace, selector).await?;

        let mut templates = Vec::new();
        for cm in config_maps {
            for (key, content) in &cm.data {
                match parse_template_entry(key, content) {
                    Ok(Some(template)) => {
                        debug!(
                            template = %template.name,
                            tasks = template.tasks.len(),
                            family = ?template.family,
                            "Loaded template"
                        );
                        templates.push(template);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(config_map = %cm.metadata.name, key = %key, "Failed to parse template: {}", e),
                }
            }
        }

        let count = templates.len();
        self.replace_all(templates).await;
        info!("Loaded {} lab templates from {}", count, namespace);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE_YAML: &str = r#"
name: docker-basics
title: Docker Basics
description: Learn containers
timerEnabled: true
maxDuration: 30m
youtubeVideo: https://youtu.be/abc
tasks:
  - name: Run a container
    description: Start hello-world
    steps:
      - docker run hello-world
    tips:
      - type: info
        title: Hint
        content: use docker ps
    validation:
      - command: docker ps -a | grep -c hello-world
        expectedOutput: "1"
        errorMessage: Container not found
"#;

    #[test]
    fn parses_template_yaml_and_resolves_family() {
        let template = parse_template_entry("docker.yaml", TEMPLATE_YAML)
            .unwrap()
            .unwrap();
        assert_eq!(template.name, "docker-basics");
        assert_eq!(template.family, SandboxFamily::Docker);
        assert_eq!(template.lifetime, Some(Duration::from_secs(30 * 60)));
        assert_eq!(template.tasks[0].validators[0].expected_output, "1");
        assert_eq!(template.tasks[0].tips[0].kind, "info");
        assert!(template.image.is_none());
    }

    #[test]
    fn skips_non_yaml_keys() {
        assert!(parse_template_entry("README.md", "# hi").unwrap().is_none());
    }

    #[test]
    fn classifies_families() {
        assert_eq!(SandboxFamily::classify("kubernetes-pods"), SandboxFamily::Kubernetes);
        assert_eq!(SandboxFamily::classify("Kubernetes-Pods"), SandboxFamily::Generic);
        assert_eq!(SandboxFamily::classify("Intro-Docker"), SandboxFamily::Docker);
        assert_eq!(SandboxFamily::classify("aws-s3"), SandboxFamily::CloudEmulation);
        assert_eq!(SandboxFamily::classify("localstack-lambda"), SandboxFamily::CloudEmulation);
        assert_eq!(SandboxFamily::classify("linux-basics"), SandboxFamily::Generic);
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn invalid_max_duration_falls_back_to_default() {
        let template: LabTemplate =
            serde_yaml::from_str("name: x\ntimerEnabled: true\nmaxDuration: soon\n").unwrap();
        let template = template.resolved();
        assert!(template.lifetime.is_none());
        assert_eq!(
            template.lifetime_or(Duration::from_secs(3600)),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn catalog_lists_sorted_and_replaces_wholesale() {
        let make = |name: &str| -> LabTemplate {
            serde_yaml::from_str(&format!("name: {}\n", name)).unwrap()
        };
        let catalog = TemplateCatalog::from_templates(vec![make("b-lab"), make("a-lab")]);
        let names: Vec<_> = catalog.list().await.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["a-lab", "b-lab"]);

        catalog.replace_all(vec![make("c-lab").resolved()]).await;
        assert!(catalog.get("a-lab").await.is_none());
        assert!(catalog.get("c-lab").await.is_some());
    }
}
