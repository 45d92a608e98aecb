//! Cluster objects that make up one sandbox.

use std::collections::BTreeMap;

use super::content::{self, InitScript};
use crate::cluster::types::{
    ConfigMapVolumeSource, ContainerPort, EnvVar, ResourceRequirements, SecurityContext, Volume,
    VolumeMount,
};
use crate::cluster::{ConfigMap, Container, Namespace, ObjectMeta, Pod, PodSpec};
use crate::config::{Config, LAB_APP_LABEL, LAB_FILES_CONFIG_MAP, LAB_FILES_MOUNT, SCRIPTS_MOUNT};
use crate::template::{LabTemplate, SandboxFamily};

const LAB_FILES_VOLUME: &str = "lab-files";
const SCRIPTS_VOLUME: &str = "init-scripts";
const SCRIPT_MODE: i32 = 0o755;

/// Selector matching every lab workload of a namespace.
pub fn lab_selector() -> String {
    format!("app={}", LAB_APP_LABEL)
}

pub fn namespace(name: &str, user_id: &str) -> Namespace {
    Namespace::new(
        ObjectMeta::named(name).with_labels([("createdBy", "girus"), ("userId", user_id)]),
    )
}

pub fn lab_files(namespace: &str, template: &LabTemplate) -> ConfigMap {
    let mut meta = ObjectMeta::named(LAB_FILES_CONFIG_MAP);
    meta.namespace = Some(namespace.to_string());
    ConfigMap::new(
        meta,
        BTreeMap::from([(
            "welcome.md".to_string(),
            content::welcome_markdown(template),
        )]),
    )
}

pub fn init_script_map(namespace: &str, script: &InitScript) -> ConfigMap {
    let mut meta = ObjectMeta::named(script.config_map);
    meta.namespace = Some(namespace.to_string());
    ConfigMap::new(
        meta,
        BTreeMap::from([(script.file.to_string(), script.body.to_string())]),
    )
}

/// Image precedence: template override, then family image, then the default.
pub fn image_for(config: &Config, template: &LabTemplate) -> String {
    if let Some(image) = template.image.as_deref().filter(|i| !i.trim().is_empty()) {
        return image.to_string();
    }
    match template.family {
        SandboxFamily::Kubernetes => config.kubernetes_image.clone(),
        SandboxFamily::Docker => config.docker_image.clone(),
        SandboxFamily::CloudEmulation => config.cloud_image.clone(),
        SandboxFamily::Generic => config.default_image.clone(),
    }
}

/// Entry command of the lab container.
pub fn entry_command(config: &Config, family: SandboxFamily) -> Vec<String> {
    let script = match family {
        SandboxFamily::Kubernetes => "tail -f /dev/null".to_string(),
        SandboxFamily::CloudEmulation => "/entrypoint.sh".to_string(),
        SandboxFamily::Docker | SandboxFamily::Generic => match content::init_script(family) {
            Some(init) => format!("{}/{}", SCRIPTS_MOUNT, init.file),
            None => "tail -f /dev/null".to_string(),
        },
    };
    vec![config.shell.clone(), "-c".to_string(), script]
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// The sandbox workload for `user_id` running `template`.
pub fn pod(config: &Config, namespace: &str, name: &str, user_id: &str, template: &LabTemplate) -> Pod {
    let mut volumes = vec![Volume {
        name: LAB_FILES_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: LAB_FILES_CONFIG_MAP.to_string(),
            default_mode: None,
        }),
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: LAB_FILES_VOLUME.to_string(),
        mount_path: LAB_FILES_MOUNT.to_string(),
    }];
    if let Some(script) = content::init_script(template.family) {
        volumes.push(Volume {
            name: SCRIPTS_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: script.config_map.to_string(),
                default_mode: Some(SCRIPT_MODE),
            }),
        });
        volume_mounts.push(VolumeMount {
            name: SCRIPTS_VOLUME.to_string(),
            mount_path: SCRIPTS_MOUNT.to_string(),
        });
    }

    let resources = &config.resources;
    let container = Container {
        name: config.container_name.clone(),
        image: image_for(config, template),
        command: entry_command(config, template.family),
        ports: vec![ContainerPort {
            container_port: 22,
            protocol: Some("TCP".to_string()),
        }],
        env: vec![
            env("LANG", "C.UTF-8"),
            env("LC_ALL", "C.UTF-8"),
            env("TERM", "xterm-256color"),
        ],
        security_context: Some(SecurityContext {
            privileged: Some(true),
        }),
        resources: Some(ResourceRequirements {
            requests: BTreeMap::from([
                ("cpu".to_string(), resources.cpu_request.clone()),
                ("memory".to_string(), resources.memory_request.clone()),
            ]),
            limits: BTreeMap::from([
                ("cpu".to_string(), resources.cpu_limit.clone()),
                ("memory".to_string(), resources.memory_limit.clone()),
            ]),
        }),
        volume_mounts,
    };

    let mut meta = ObjectMeta::named(name).with_labels([
        ("app", LAB_APP_LABEL),
        ("user", user_id),
        ("template", template.name.as_str()),
    ]);
    meta.namespace = Some(namespace.to_string());

    Pod::new(
        meta,
        PodSpec {
            containers: vec![container],
            volumes,
            restart_policy: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, image: Option<&str>) -> LabTemplate {
        let mut t: LabTemplate = serde_yaml::from_str(&format!("name: {}\ntitle: T\n", name)).unwrap();
        t.image = image.map(str::to_string);
        t.resolved()
    }

    #[test]
    fn image_precedence() {
        let config = Config::default();
        assert_eq!(
            image_for(&config, &template("docker-intro", Some("custom:1"))),
            "custom:1"
        );
        assert_eq!(
            image_for(&config, &template("docker-intro", None)),
            config.docker_image
        );
        assert_eq!(
            image_for(&config, &template("kubernetes-pods", Some("  "))),
            config.kubernetes_image
        );
        assert_eq!(
            image_for(&config, &template("aws-s3", None)),
            config.cloud_image
        );
        assert_eq!(
            image_for(&config, &template("linux", None)),
            config.default_image
        );
    }

    #[test]
    fn entry_commands_per_family() {
        let config = Config::default();
        let last = |family| entry_command(&config, family).pop().unwrap();
        assert_eq!(last(SandboxFamily::Kubernetes), "tail -f /dev/null");
        assert_eq!(last(SandboxFamily::Docker), "/scripts/init-docker.sh");
        assert_eq!(last(SandboxFamily::CloudEmulation), "/entrypoint.sh");
        assert_eq!(last(SandboxFamily::Generic), "/scripts/init.sh");
        assert_eq!(entry_command(&config, SandboxFamily::Generic)[..2], ["/bin/bash", "-c"]);
    }

    #[test]
    fn docker_pod_is_privileged_and_mounts_its_script() {
        let config = Config::default();
        let pod = pod(&config, "lab-alice", "lab-alice-1-abc", "alice", &template("docker-intro", None));

        assert_eq!(pod.label("app"), Some("girus-lab"));
        assert_eq!(pod.label("user"), Some("alice"));
        assert_eq!(pod.label("template"), Some("docker-intro"));

        let container = &pod.spec.containers[0];
        assert_eq!(container.name, "lab");
        assert_eq!(container.security_context.as_ref().unwrap().privileged, Some(true));
        assert_eq!(container.ports[0].container_port, 22);
        assert!(container.env.contains(&env("TERM", "xterm-256color")));
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(resources.requests["cpu"], "200m");
        assert_eq!(resources.limits["memory"], "1Gi");

        let script_volume = pod
            .spec
            .volumes
            .iter()
            .find_map(|v| v.config_map.as_ref().filter(|c| c.name == "docker-init-script"))
            .unwrap();
        assert_eq!(script_volume.default_mode, Some(0o755));
        assert!(container.volume_mounts.iter().any(|m| m.mount_path == "/scripts"));
        assert!(container.volume_mounts.iter().any(|m| m.mount_path == "/lab-files"));
    }

    #[test]
    fn kubernetes_pod_has_no_init_script() {
        let config = Config::default();
        let pod = pod(&config, "lab-bob", "lab-bob-1-abc", "bob", &template("kubernetes-basics", None));
        assert_eq!(pod.spec.volumes.len(), 1);
        assert_eq!(pod.spec.containers[0].volume_mounts.len(), 1);
    }

    #[test]
    fn namespace_and_content_labels() {
        let ns = namespace("lab-alice", "alice");
        assert_eq!(ns.metadata.labels["createdBy"], "girus");
        assert_eq!(ns.metadata.labels["userId"], "alice");

        let files = lab_files("lab-alice", &template("linux", None));
        assert!(files.data["welcome.md"].starts_with("# Bem-vindo ao Laboratório T"));
        assert_eq!(lab_selector(), "app=girus-lab");
    }
}
