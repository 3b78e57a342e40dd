//! Database cluster operator
//!
//! Guards the termination of cluster members on Kubernetes.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dbcluster_operator::config::OperatorConfig;
use dbcluster_operator::shutdown::{wait_for_signal, ShutdownCoordinator};
use dbcluster_operator::{controller, metrics};

#[derive(Parser, Debug)]
#[command(name = "dbcluster-operator")]
#[command(about = "Kubernetes operator guarding the termination of database cluster members")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, default_value = "")]
    namespace: String,

    /// Metrics server port
    #[arg(short, long, default_value = "8080")]
    metrics_port: u16,

    /// Health check port
    #[arg(short = 'H', long, default_value = "8081")]
    health_port: u16,

    /// Log filter, e.g. `info` or `dbcluster_operator=debug`
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .json()
        .init();

    let config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OperatorConfig::default(),
    };

    info!("Starting database cluster operator");
    info!(namespace = %args.namespace, "Watching namespace");

    let shutdown = ShutdownCoordinator::new();
    let signal_handle = tokio::spawn(wait_for_signal(shutdown.clone()));

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(args.metrics_port));
    let health_handle = tokio::spawn(run_health_server(args.health_port));

    let client = Client::try_default().await?;
    let controller_handle = {
        let shutdown = shutdown.clone();
        let namespace = args.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = controller::run(client, config, &namespace, shutdown).await {
                error!(error = %e, "Controller error");
            }
        })
    };

    tokio::select! {
        _ = controller_handle => info!("Controller stopped"),
        res = metrics_handle => {
            if let Ok(Err(e)) = res {
                error!(error = %e, "Metrics server failed");
            }
        }
        res = health_handle => {
            if let Ok(Err(e)) = res {
                error!(error = %e, "Health server failed");
            }
        }
    }

    shutdown.shutdown();
    signal_handle.abort();
    Ok(())
}

async fn run_health_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health port {}", port))?;
    info!(port = %port, "Health server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}
