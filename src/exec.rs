//! Execution Bridge: the only path by which the control plane talks to a live sandbox.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::cluster::{Cluster, ExecEvent, ExecInput, ExecOptions, ExitStatus, Pod, PodPhase, TerminalSize};
use crate::config::Config;
use crate::error::{ClusterError, LabError, Result};
use crate::identity::SandboxRef;

/// Prefix that pins probe output to a UTF-8 locale.
const LOCALE_PRELUDE: &str = "export LC_ALL=C.UTF-8 && export LANG=C.UTF-8 && ";

/// Captured result of a one-shot command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.is_success()
    }
}

/// Input read from an interactive client.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalInput {
    Data(Bytes),
    Resize(TerminalSize),
}

/// The capabilities an interactive client must offer.
#[async_trait]
pub trait TerminalIo: Send {
    /// Next chunk of input or size change. `None` once the client is gone.
    async fn read(&mut self) -> Option<TerminalInput>;

    async fn write(&mut self, data: Bytes) -> std::io::Result<()>;
}

/// How an interactive session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// The remote shell exited or its stream closed.
    Exited(ExitStatus),
    /// The client went away first.
    ClientClosed,
}

/// Argument vector running `command` under `shell` with a UTF-8 locale.
pub fn probe_command(shell: &str, command: &str) -> Vec<String> {
    vec![
        shell.to_string(),
        "-c".to_string(),
        format!("{}{}", LOCALE_PRELUDE, command),
    ]
}

pub struct Executor {
    cluster: Arc<dyn Cluster>,
    config: Arc<Config>,
}

impl Executor {
    pub fn new(cluster: Arc<dyn Cluster>, config: Arc<Config>) -> Self {
        Self { cluster, config }
    }

    /// Fetch the workload, mapping absence to [`LabError::WorkloadNotFound`].
    pub async fn workload(&self, target: &SandboxRef) -> Result<Pod> {
        let fetch = self.cluster.get_pod(&target.namespace, &target.workload);
        match timeout(self.config.exec_timeout, fetch).await {
            Err(_) => Err(LabError::ExecutionTimeout(self.config.exec_timeout)),
            Ok(Ok(pod)) => Ok(pod),
            Ok(Err(e)) if e.is_not_found() => Err(LabError::WorkloadNotFound {
                namespace: target.namespace.clone(),
                name: target.workload.clone(),
            }),
            Ok(Err(e)) => Err(LabError::at("get workload")(e)),
        }
    }

    /// Require the workload to be running with every container ready.
    pub async fn ensure_ready(&self, target: &SandboxRef) -> Result<Pod> {
        let pod = self.workload(target).await?;
        let not_ready = |reason: String| LabError::SandboxNotReady {
            namespace: target.namespace.clone(),
            name: target.workload.clone(),
            reason,
        };

        if pod.phase() != PodPhase::Running {
            return Err(not_ready(format!("phase is {}", pod.phase())));
        }
        if !pod.all_containers_ready() {
            return Err(not_ready("containers are not ready".to_string()));
        }
        if let Some(container) = &target.container {
            if !pod.has_container(container) {
                return Err(not_ready(format!("no container named {}", container)));
            }
        }
        Ok(pod)
    }

    /// Run `command` through the shell and capture its output.
    pub async fn exec(&self, target: &SandboxRef, command: &str) -> Result<CommandOutput> {
        let limit = self.config.exec_timeout;
        let output = timeout(limit, async {
            self.ensure_ready(target).await?;
            self.run_captured(target, probe_command(&self.config.shell, command)).await
        })
        .await
        .map_err(|_| LabError::ExecutionTimeout(limit))??;

        debug!(
            sandbox = %target,
            command,
            status = ?output.status,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "Probe finished"
        );
        Ok(output)
    }

    fn container(&self, target: &SandboxRef) -> String {
        target
            .container
            .clone()
            .unwrap_or_else(|| self.config.container_name.clone())
    }

    async fn run_captured(&self, target: &SandboxRef, command: Vec<String>) -> Result<CommandOutput> {
        let options = ExecOptions {
            command,
            container: Some(self.container(target)),
            stdin: false,
            tty: false,
        };
        let channel = self
            .cluster
            .exec(&target.namespace, &target.workload, &options)
            .await
            .map_err(LabError::at("open exec stream"))?;
        drop(channel.input);

        let mut events = channel.events;
        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        let mut status = None;
        while let Some(event) = events.recv().await {
            match event {
                ExecEvent::Stdout(chunk) => stdout.extend_from_slice(&chunk),
                ExecEvent::Stderr(chunk) => stderr.extend_from_slice(&chunk),
                ExecEvent::Exit(exit) => {
                    status = Some(exit);
                    break;
                }
            }
        }
        // Output without an exit status may be truncated.
        let status = status.ok_or_else(|| {
            LabError::at("read exec stream")(ClusterError::Transport(
                "stream ended before the command reported its exit status".to_string(),
            ))
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status,
        })
    }

    /// Attach `io` to an interactive shell in the sandbox.
    ///
    /// Only establishing the stream is bounded by the exec timeout; the session
    /// itself lasts until the shell exits or the client goes away.
    pub async fn exec_interactive<T>(&self, target: &SandboxRef, io: &mut T) -> Result<SessionEnd>
    where
        T: TerminalIo + ?Sized,
    {
        let options = ExecOptions {
            command: vec![self.config.shell.clone()],
            container: Some(self.container(target)),
            stdin: true,
            tty: true,
        };
        let limit = self.config.exec_timeout;
        let channel = timeout(limit, async {
            self.ensure_ready(target).await?;
            self.cluster
                .exec(&target.namespace, &target.workload, &options)
                .await
                .map_err(LabError::at("open exec stream"))
        })
        .await
        .map_err(|_| LabError::ExecutionTimeout(limit))??;
        info!(sandbox = %target, "Interactive session attached");

        let input = channel.input;
        let mut events = channel.events;
        // Input waiting for room in the stream. Output keeps draining meanwhile.
        let mut pending: Option<ExecInput> = None;
        let end = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ExecEvent::Stdout(chunk)) | Some(ExecEvent::Stderr(chunk)) => {
                        if io.write(chunk).await.is_err() {
                            break SessionEnd::ClientClosed;
                        }
                    }
                    Some(ExecEvent::Exit(status)) => break SessionEnd::Exited(status),
                    None => {
                        let cut = ExitStatus::failure(None, "exec stream ended without an exit status");
                        break SessionEnd::Exited(cut);
                    }
                },
                permit = input.reserve(), if pending.is_some() => {
                    let message = pending.take();
                    // An error means the stream is shutting down; its exit event follows.
                    if let (Ok(permit), Some(message)) = (permit, message) {
                        permit.send(message);
                    }
                }
                incoming = io.read(), if pending.is_none() => {
                    pending = match incoming {
                        Some(TerminalInput::Data(data)) => Some(ExecInput::Stdin(data)),
                        Some(TerminalInput::Resize(size)) => Some(ExecInput::Resize(size)),
                        None => break SessionEnd::ClientClosed,
                    };
                }
            }
        };

        info!(sandbox = %target, end = ?end, "Interactive session finished");
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_commands_in_utf8_locale() {
        let argv = probe_command("/bin/bash", "echo hello");
        assert_eq!(
            argv,
            vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "export LC_ALL=C.UTF-8 && export LANG=C.UTF-8 && echo hello".to_string(),
            ]
        );
    }

    #[test]
    fn command_output_success_follows_exit_status() {
        let mut output = CommandOutput {
            stdout: "hello\n".into(),
            stderr: String::new(),
            status: ExitStatus::success(),
        };
        assert!(output.success());
        output.status = ExitStatus::failure(Some(1), "exit 1");
        assert!(!output.success());
    }
}
