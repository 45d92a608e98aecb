//! In-memory cluster used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use lab_sandbox::cluster::types::{ContainerStatus, PodStatus};
use lab_sandbox::cluster::{
    Cluster, ClusterResult, ConfigMap, DeleteOptions, ExecChannel, ExecEvent, ExecInput,
    ExecOptions, ExitStatus, Namespace, ObjectMeta, Pod, PodPhase, TerminalSize,
};
use lab_sandbox::config::Config;
use lab_sandbox::error::ClusterError;
use lab_sandbox::index::InMemoryIndex;
use lab_sandbox::state::AppState;
use lab_sandbox::template::{LabTemplate, TemplateCatalog};

/// Canned result of a one-shot command.
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
    pub delay: Option<Duration>,
    /// The stream closes after the output without reporting an exit status.
    pub truncated: bool,
}

impl Scripted {
    pub fn stdout(out: &str) -> Self {
        Self {
            stdout: out.to_string(),
            ..Default::default()
        }
    }

    pub fn stderr(err: &str, code: i32) -> Self {
        Self {
            stderr: err.to_string(),
            code,
            ..Default::default()
        }
    }

    pub fn truncated(out: &str) -> Self {
        Self {
            stdout: out.to_string(),
            truncated: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeletedPod {
    pub namespace: String,
    pub name: String,
    pub grace: Option<i64>,
}

#[derive(Default)]
struct FakeState {
    namespaces: BTreeMap<String, Namespace>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    pods: BTreeMap<(String, String), Pod>,
    deleted_pods: Vec<DeletedPod>,
    scripts: HashMap<String, Scripted>,
    probes: Vec<String>,
    stdin: Vec<u8>,
    resizes: Vec<TerminalSize>,
}

pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
    /// New pods start Running with ready containers.
    pub auto_ready: AtomicBool,
    pub fail_namespace_delete: AtomicBool,
    pub fail_config_map_create: AtomicBool,
    pub fail_pod_create: AtomicBool,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            auto_ready: AtomicBool::new(true),
            fail_namespace_delete: AtomicBool::new(false),
            fail_config_map_create: AtomicBool::new(false),
            fail_pod_create: AtomicBool::new(false),
        }
    }
}

/// Match `labels` against an equality-based selector such as `app=web,tier=db`.
fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once("!=") {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) != Some(v.trim()),
            None => match term.split_once('=') {
                Some((k, v)) => {
                    let v = v.trim_start_matches('=');
                    labels.get(k.trim()).map(String::as_str) == Some(v.trim())
                }
                None => labels.contains_key(term),
            },
        })
}

/// User command inside the locale-normalizing wrapper.
fn user_command(argv: &[String]) -> String {
    let script = argv.last().cloned().unwrap_or_default();
    match script.rsplit_once("LANG=C.UTF-8 && ") {
        Some((_, cmd)) => cmd.to_string(),
        None => script,
    }
}

/// Behaviour of commands without a script: `echo` prints, anything else fails.
fn default_response(command: &str) -> Scripted {
    match command.strip_prefix("echo ") {
        Some(text) => Scripted::stdout(&format!("{}\n", text.trim_matches('"'))),
        None => Scripted::stderr(&format!("bash: {}: command not found\n", command), 127),
    }
}

fn ready_status(ready: bool, phase: PodPhase) -> PodStatus {
    PodStatus {
        phase,
        container_statuses: vec![ContainerStatus {
            name: "lab".to_string(),
            ready,
            restart_count: 0,
        }],
        start_time: Some(Utc::now()),
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn script(&self, command: &str, response: Scripted) {
        self.lock().scripts.insert(command.to_string(), response);
    }

    pub fn add_config_map(&self, namespace: &str, name: &str, labels: &[(&str, &str)], data: &[(&str, &str)]) {
        let mut meta = ObjectMeta::named(name).with_labels(labels.iter().copied());
        meta.namespace = Some(namespace.to_string());
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.lock()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), ConfigMap::new(meta, data));
    }

    pub fn insert_pod(&self, namespace: &str, mut pod: Pod) {
        pod.metadata.namespace = Some(namespace.to_string());
        let mut state = self.lock();
        state
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Namespace::new(ObjectMeta::named(namespace)));
        state
            .pods
            .insert((namespace.to_string(), pod.metadata.name.clone()), pod);
    }

    pub fn set_created(&self, namespace: &str, name: &str, at: DateTime<Utc>) {
        if let Some(pod) = self.lock().pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.metadata.creation_timestamp = Some(at);
        }
    }

    pub fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase, ready: bool) {
        if let Some(pod) = self.lock().pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.status = Some(ready_status(ready, phase));
        }
    }

    pub fn pods_in(&self, namespace: &str) -> Vec<Pod> {
        self.lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(name)
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn deleted_pods(&self) -> Vec<DeletedPod> {
        self.lock().deleted_pods.clone()
    }

    /// User commands run through one-shot exec, in order.
    pub fn probes(&self) -> Vec<String> {
        self.lock().probes.clone()
    }

    pub fn stdin_log(&self) -> Vec<u8> {
        self.lock().stdin.clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.lock().resizes.clone()
    }

    fn one_shot(&self, options: &ExecOptions) -> ExecChannel {
        let command = user_command(&options.command);
        let response = {
            let mut state = self.lock();
            state.probes.push(command.clone());
            let scripted = state.scripts.get(&command).cloned();
            scripted.unwrap_or_else(|| default_response(&command))
        };

        let (input, _input_rx) = mpsc::channel(1);
        let (events, events_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            if !response.stdout.is_empty() {
                let _ = events.send(ExecEvent::Stdout(Bytes::from(response.stdout))).await;
            }
            if !response.stderr.is_empty() {
                let _ = events.send(ExecEvent::Stderr(Bytes::from(response.stderr))).await;
            }
            if response.truncated {
                return;
            }
            let status = if response.code == 0 {
                ExitStatus::success()
            } else {
                ExitStatus::failure(
                    Some(response.code),
                    format!("command terminated with non-zero exit code: {}", response.code),
                )
            };
            let _ = events.send(ExecEvent::Exit(status)).await;
        });
        ExecChannel {
            input,
            events: events_rx,
        }
    }

    /// A shell that echoes its input and exits on an `exit` line.
    fn echo_shell(&self) -> ExecChannel {
        let (input, mut input_rx) = mpsc::channel::<ExecInput>(16);
        let (events, events_rx) = mpsc::channel(16);
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut line = Vec::new();
            while let Some(message) = input_rx.recv().await {
                match message {
                    ExecInput::Resize(size) => {
                        state.lock().unwrap().resizes.push(size);
                    }
                    ExecInput::Stdin(data) => {
                        {
                            state.lock().unwrap().stdin.extend_from_slice(&data);
                        }
                        if events.send(ExecEvent::Stdout(data.clone())).await.is_err() {
                            return;
                        }
                        for &b in data.iter() {
                            if b == b'\r' || b == b'\n' {
                                if String::from_utf8_lossy(&line).trim() == "exit" {
                                    let _ = events.send(ExecEvent::Exit(ExitStatus::success())).await;
                                    return;
                                }
                                line.clear();
                            } else {
                                line.push(b);
                            }
                        }
                    }
                }
            }
            let _ = events.send(ExecEvent::Exit(ExitStatus::success())).await;
        });
        ExecChannel {
            input,
            events: events_rx,
        }
    }
}

fn quota_exceeded() -> ClusterError {
    ClusterError::Api {
        status: 403,
        message: "quota exceeded".to_string(),
    }
}

fn not_found(kind: &'static str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        name: name.to_string(),
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<Namespace> {
        let mut state = self.lock();
        let name = namespace.metadata.name.clone();
        if state.namespaces.contains_key(&name) {
            return Err(ClusterError::AlreadyExists {
                kind: "namespace",
                name,
            });
        }
        state.namespaces.insert(name, namespace.clone());
        Ok(namespace.clone())
    }

    async fn list_namespaces(&self, selector: Option<&str>) -> ClusterResult<Vec<Namespace>> {
        Ok(self
            .lock()
            .namespaces
            .values()
            .filter(|ns| selector.map_or(true, |s| selector_matches(&ns.metadata.labels, s)))
            .cloned()
            .collect())
    }

    async fn delete_namespace(&self, name: &str, _options: &DeleteOptions) -> ClusterResult<()> {
        if self.fail_namespace_delete.load(Ordering::SeqCst) {
            return Err(ClusterError::Api {
                status: 500,
                message: "namespace deletion failed".to_string(),
            });
        }
        let mut state = self.lock();
        state
            .namespaces
            .remove(name)
            .ok_or_else(|| not_found("namespace", name))?;
        state.pods.retain(|(ns, _), _| ns != name);
        state.config_maps.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> ClusterResult<ConfigMap> {
        if self.fail_config_map_create.load(Ordering::SeqCst) {
            return Err(quota_exceeded());
        }
        let mut state = self.lock();
        if !state.namespaces.contains_key(namespace) {
            return Err(not_found("namespace", namespace));
        }
        let key = (namespace.to_string(), config_map.metadata.name.clone());
        if state.config_maps.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "configmap",
                name: key.1,
            });
        }
        state.config_maps.insert(key, config_map.clone());
        Ok(config_map.clone())
    }

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> ClusterResult<Vec<ConfigMap>> {
        Ok(self
            .lock()
            .config_maps
            .iter()
            .filter(|((ns, _), cm)| ns == namespace && selector_matches(&cm.metadata.labels, selector))
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.lock()
            .config_maps
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("configmap", name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<Pod> {
        if self.fail_pod_create.load(Ordering::SeqCst) {
            return Err(quota_exceeded());
        }
        let ready = self.auto_ready.load(Ordering::SeqCst);
        let mut state = self.lock();
        if !state.namespaces.contains_key(namespace) {
            return Err(not_found("namespace", namespace));
        }
        let key = (namespace.to_string(), pod.metadata.name.clone());
        if state.pods.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "pod",
                name: key.1,
            });
        }
        let mut created = pod.clone();
        created.metadata.creation_timestamp = Some(Utc::now());
        created.status = Some(if ready {
            ready_status(true, PodPhase::Running)
        } else {
            ready_status(false, PodPhase::Pending)
        });
        state.pods.insert(key, created.clone());
        Ok(created)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("pod", name))
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> ClusterResult<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && selector.map_or(true, |s| selector_matches(&pod.metadata.labels, s))
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str, options: &DeleteOptions) -> ClusterResult<()> {
        let mut state = self.lock();
        state
            .pods
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found("pod", name))?;
        state.deleted_pods.push(DeletedPod {
            namespace: namespace.to_string(),
            name: name.to_string(),
            grace: options.grace_period_seconds,
        });
        Ok(())
    }

    async fn exec(&self, namespace: &str, pod: &str, options: &ExecOptions) -> ClusterResult<ExecChannel> {
        if !self
            .lock()
            .pods
            .contains_key(&(namespace.to_string(), pod.to_string()))
        {
            return Err(not_found("pod", pod));
        }
        Ok(if options.tty {
            self.echo_shell()
        } else {
            self.one_shot(options)
        })
    }
}

pub const LINUX_TEMPLATE: &str = r#"
name: linux-basics
title: Linux Básico
description: Primeiros passos no terminal
timerEnabled: true
maxDuration: 30m
tasks:
  - name: Saudação
    description: Diga olá
    steps:
      - echo hello
    validation:
      - command: echo hello
        expectedOutput: hello
        errorMessage: A saudação não foi encontrada
  - name: Arquivo
    description: Crie o arquivo
    steps:
      - touch /tmp/ok
    validation:
      - command: test -f /tmp/ok && echo present
        expectedOutput: present
        errorMessage: O arquivo /tmp/ok não existe
  - name: Despedida
    description: Diga tchau
    steps:
      - echo bye
    validation:
      - command: echo bye
        expectedOutput: bye
        errorMessage: A despedida não foi encontrada
"#;

pub const DOCKER_TEMPLATE: &str = r#"
name: docker-basics
title: Docker Básico
description: Containers
tasks:
  - name: Rodar
    description: Rode um container
    steps:
      - docker run hello-world
    validation:
      - command: docker ps -a -q | wc -l
        expectedOutput: "1"
        errorMessage: Nenhum container encontrado
"#;

pub fn template(yaml: &str) -> LabTemplate {
    serde_yaml::from_str(yaml).unwrap()
}

pub fn test_config() -> Config {
    Config {
        replace_wait: Duration::from_millis(5),
        keepalive_interval: Duration::from_millis(20),
        monitor_interval: Duration::from_millis(20),
        exec_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

pub struct Harness {
    pub fake: Arc<FakeCluster>,
    pub index: Arc<InMemoryIndex>,
    pub state: AppState,
}

pub fn harness_with(config: Config) -> Harness {
    let fake = Arc::new(FakeCluster::new());
    let catalog = Arc::new(TemplateCatalog::from_templates(vec![
        template(LINUX_TEMPLATE),
        template(DOCKER_TEMPLATE),
    ]));
    let index = Arc::new(InMemoryIndex::new());
    let state = AppState::new(fake.clone(), catalog, index.clone(), Arc::new(config));
    Harness { fake, index, state }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}
