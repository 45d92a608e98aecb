//! lab-sandbox - control plane for per-user lab environments.
//!
//! Usage:
//!   lab-sandbox serve [--port 8080] [--kubeconfig PATH]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lab_sandbox::cluster::{Cluster, KubeClient};
use lab_sandbox::config::Config;
use lab_sandbox::http_server;
use lab_sandbox::index::InMemoryIndex;
use lab_sandbox::state::AppState;
use lab_sandbox::template::TemplateCatalog;

#[derive(Parser, Debug)]
#[command(name = "lab-sandbox")]
#[command(about = "Control plane for per-user lab sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and the expiration monitor
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Kubeconfig to use instead of in-cluster credentials
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Image for labs without a more specific one
    #[arg(long, env = "LAB_DEFAULT_IMAGE", default_value = "ubuntu:latest")]
    default_image: String,

    #[arg(long, default_value = "linuxtips/girus-kind-multi-node:0.1")]
    kubernetes_image: String,

    #[arg(long, default_value = "linuxtips/girus-devops:0.1")]
    docker_image: String,

    #[arg(long, default_value = "linuxtips/girus-localstack:0.1")]
    cloud_image: String,

    /// Namespace holding the lab template config maps
    #[arg(long, default_value = "girus")]
    templates_namespace: String,

    /// Seconds between expiration scans
    #[arg(long, default_value = "10")]
    monitor_interval_secs: u64,
}

impl ServeArgs {
    fn into_config(self) -> Config {
        Config {
            port: self.port,
            kubeconfig: self.kubeconfig,
            default_image: self.default_image,
            kubernetes_image: self.kubernetes_image,
            docker_image: self.docker_image,
            cloud_image: self.cloud_image,
            templates_namespace: self.templates_namespace,
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Serve(serve_args)) => {
            if let Err(e) = serve(serve_args.into_config()).await {
                error!("Fatal: {}", e);
                exit(1);
            }
        }
        None => {
            eprintln!("Error: Use 'serve' subcommand");
            exit(1);
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);
    let cluster: Arc<dyn Cluster> = Arc::new(KubeClient::from_config(&config)?);

    // Fail fast when the cluster is unreachable or credentials are wrong.
    cluster.list_namespaces(None).await?;

    let catalog = Arc::new(TemplateCatalog::new());
    if let Err(e) = catalog
        .load_from_cluster(cluster.as_ref(), &config.templates_namespace, &config.template_selector)
        .await
    {
        warn!("Could not load lab templates: {}", e);
    }

    let state = AppState::new(cluster, catalog, Arc::new(InMemoryIndex::new()), config.clone());
    if let Err(e) = state.provisioner.rebuild_index().await {
        warn!("Could not rebuild sandbox index: {}", e);
    }

    let cancel = CancellationToken::new();
    let monitor = Arc::new(state.expiration_monitor()).spawn(cancel.child_token());

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            cancel.cancel();
        }
    };

    let served = http_server::run_server(config.port, state, shutdown).await;
    cancel.cancel();
    if let Err(e) = monitor.await {
        warn!("Expiration monitor ended abnormally: {}", e);
    }
    served?;
    info!("Stopped");
    Ok(())
}
