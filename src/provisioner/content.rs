//! Files published into a sandbox: the welcome page and the init scripts.

use crate::template::{LabTemplate, SandboxFamily};

/// A script shipped in its own config map and mounted at `/scripts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitScript {
    pub config_map: &'static str,
    pub file: &'static str,
    pub body: &'static str,
}

const DOCKER_INIT: &str = r#"#!/bin/bash
set -e

echo "Inicializando ambiente Docker para o laboratório"
mkdir -p /tmp/docker-logs
chmod 777 /tmp/docker-logs

sudo dockerd &>/tmp/docker-logs/dockerd.log &
DOCKERD_PID=$!

if ! ps -p $DOCKERD_PID > /dev/null; then
    echo "Falha ao iniciar o Docker, tentando novamente:"
    tail -n 20 /tmp/docker-logs/dockerd.log
    sudo dockerd > /tmp/docker-logs/dockerd.log 2>&1 &
    sleep 3
fi

echo "Aguardando o Docker iniciar..."
for attempt in $(seq 1 30); do
    if docker info > /dev/null 2>&1; then
        echo "Docker iniciado com sucesso!"
        break
    fi
    if [ "$attempt" -eq 30 ]; then
        echo "Docker não respondeu a tempo. Últimas linhas do log:"
        tail -n 20 /tmp/docker-logs/dockerd.log
    fi
    sleep 1
done

tail -f /dev/null
"#;

const GENERIC_INIT: &str = r#"#!/bin/bash
set -e

echo "Ambiente do laboratório pronto para uso!"

tail -f /dev/null
"#;

/// Init script for a family, if it needs one.
pub fn init_script(family: SandboxFamily) -> Option<InitScript> {
    match family {
        SandboxFamily::Docker => Some(InitScript {
            config_map: "docker-init-script",
            file: "init-docker.sh",
            body: DOCKER_INIT,
        }),
        SandboxFamily::Generic => Some(InitScript {
            config_map: "k3s-init-script",
            file: "init.sh",
            body: GENERIC_INIT,
        }),
        SandboxFamily::Kubernetes | SandboxFamily::CloudEmulation => None,
    }
}

/// Render the `welcome.md` page listing every task and its steps.
pub fn welcome_markdown(template: &LabTemplate) -> String {
    let mut out = format!(
        "# Bem-vindo ao Laboratório {}\n\n{}\n\n## Tarefas\n\n",
        template.title, template.description
    );
    for task in &template.tasks {
        out.push_str(&format!("- name: {}\n", task.name));
        out.push_str(&format!("  description: {}\n", task.description));
        out.push_str("  steps:\n");
        for step in &task.steps {
            out.push_str(&format!("  - {}\n", step));
        }
    }
    out
}
