//! Validation Engine: judges task completion by running probe commands in the sandbox.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{LabError, Result};
use crate::exec::Executor;
use crate::identity::SandboxRef;
use crate::template::{LabTemplate, Task, TemplateCatalog};

const TASK_PASSED: &str = "Tarefa concluída com sucesso! 🎉";
const TASK_ERROR: &str =
    "Erro ao validar a task! Veja se você concluiu o que foi pedido para a task.";

/// Outcome of a validation. A failed verdict is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    #[serde(rename = "success")]
    pub passed: bool,
    pub message: String,
}

impl Verdict {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

pub struct ValidationEngine {
    executor: Arc<Executor>,
    catalog: Arc<TemplateCatalog>,
}

impl ValidationEngine {
    pub fn new(executor: Arc<Executor>, catalog: Arc<TemplateCatalog>) -> Self {
        Self { executor, catalog }
    }

    /// Run the validators of `task` in order, stopping at the first failure.
    ///
    /// Exec errors, a non-zero exit or any stderr output produce the generic
    /// failure message; stderr is never shown to the learner.
    pub async fn validate_task(&self, target: &SandboxRef, task: &Task) -> Verdict {
        for (i, validator) in task.validators.iter().enumerate() {
            let output = match self.executor.exec(target, &validator.command).await {
                Ok(output) => output,
                Err(e) => {
                    debug!(sandbox = %target, task = %task.name, validator = i, "Probe failed: {}", e);
                    return Verdict::fail(TASK_ERROR);
                }
            };
            if !output.success() || !output.stderr.is_empty() {
                debug!(
                    sandbox = %target,
                    task = %task.name,
                    validator = i,
                    status = ?output.status,
                    stderr = %output.stderr.trim(),
                    "Probe reported an error"
                );
                return Verdict::fail(TASK_ERROR);
            }
            if output.stdout.trim() != validator.expected_output.trim() {
                debug!(
                    sandbox = %target,
                    task = %task.name,
                    validator = i,
                    got = %output.stdout.trim(),
                    expected = %validator.expected_output.trim(),
                    "Probe output mismatch"
                );
                return Verdict::fail(validator.error_message.clone());
            }
        }
        Verdict::pass(TASK_PASSED)
    }

    /// Validate every task of `template`; never stops early across tasks.
    pub async fn validate_template(&self, target: &SandboxRef, template: &LabTemplate) -> Verdict {
        let total = template.tasks.len();
        let mut pending = Vec::new();
        for (i, task) in template.tasks.iter().enumerate() {
            let verdict = self.validate_task(target, task).await;
            if !verdict.passed {
                pending.push(format!("Tarefa {} ({}): {}", i + 1, task.name, verdict.message));
            }
        }

        info!(
            sandbox = %target,
            template = %template.name,
            total,
            failed = pending.len(),
            "Lab validated"
        );
        if pending.is_empty() {
            Verdict::pass(format!(
                "Parabéns! Todas as {} tarefas do laboratório '{}' foram concluídas com sucesso!",
                total, template.title
            ))
        } else {
            Verdict::fail(format!(
                "Progresso: {}/{} tarefas concluídas. Tarefas pendentes:\n- {}",
                total - pending.len(),
                total,
                pending.join("\n- ")
            ))
        }
    }

    /// Validate task `task_index` (zero-based) of `template_id` in the workload at `target`.
    pub async fn validate_task_at(
        &self,
        target: &SandboxRef,
        template_id: &str,
        task_index: usize,
    ) -> Result<Verdict> {
        self.executor.workload(target).await?;
        let template = self
            .catalog
            .get(template_id)
            .await
            .ok_or_else(|| LabError::TemplateNotFound(template_id.to_string()))?;
        let task = template
            .tasks
            .get(task_index)
            .ok_or_else(|| LabError::InvalidTaskIndex {
                template: template_id.to_string(),
                index: task_index,
            })?;
        Ok(self.validate_task(target, task).await)
    }

    /// Validate all tasks of `template_id` in the workload at `target`.
    pub async fn validate_lab(&self, target: &SandboxRef, template_id: &str) -> Result<Verdict> {
        self.executor.workload(target).await?;
        let template = self
            .catalog
            .get(template_id)
            .await
            .ok_or_else(|| LabError::TemplateNotFound(template_id.to_string()))?;
        Ok(self.validate_template(target, &template).await)
    }
}
