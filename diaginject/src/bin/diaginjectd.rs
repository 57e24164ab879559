//! Entry point for the diaginject coordinator daemon.

use anyhow::Context;
use clap::Parser;
use diaginject::{Coordinator, CoordinatorConfig, KubeConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// diaginject coordinator - injects diagnostic helpers into pods on request
#[derive(Parser, Debug)]
#[command(author, version, about = "diaginject coordinator daemon")]
struct DaemonArgs {
    /// JSON configuration file; flags below override its values
    #[arg(short, long, env = "DIAGINJECT_CONFIG")]
    config: Option<PathBuf>,

    /// Unix socket the coordinator listens on
    #[arg(long, env = "DIAGINJECT_SOCKET")]
    socket: Option<PathBuf>,

    /// Maximum number of injections running at once
    #[arg(long, env = "DIAGINJECT_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Host directory shipped into the container
    #[arg(long, env = "DIAGINJECT_HELPER_SRC")]
    helper_src: Option<PathBuf>,

    /// Absolute path the helper directory is extracted to in the container
    #[arg(long, env = "DIAGINJECT_HELPER_DEST")]
    helper_dest: Option<PathBuf>,

    /// Container to exec into (empty: the pod's default container)
    #[arg(long, env = "DIAGINJECT_CONTAINER")]
    container: Option<String>,
}

impl DaemonArgs {
    fn into_config(self) -> anyhow::Result<CoordinatorConfig> {
        let mut config = match &self.config {
            Some(path) => CoordinatorConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CoordinatorConfig::default(),
        };

        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(src) = self.helper_src {
            config.helper_src_dir = src;
        }
        if let Some(dest) = self.helper_dest {
            config.helper_dest_dir = dest;
        }
        if let Some(container) = self.container {
            config.default_container = container;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG; defaults to info.
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
    }

    let config = DaemonArgs::parse().into_config()?;
    info!(
        socket = %config.socket_path.display(),
        max_workers = config.max_workers,
        helper_src = %config.helper_src_dir.display(),
        helper_dest = %config.helper_dest_dir.display(),
        "diaginject coordinator starting"
    );

    let coordinator = Coordinator::new(config, Arc::new(KubeConnector::new()))?;
    let listener = coordinator.bind().context("binding IPC socket")?;

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let server = coordinator.clone();
    let serving = tokio::spawn(async move { server.serve(listener).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    coordinator.shutdown().await;
    serving.await.context("accept loop panicked")??;
    info!("diaginject coordinator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = DaemonArgs::try_parse_from([
            "diaginjectd",
            "--socket",
            "/run/diag.sock",
            "--max-workers",
            "4",
            "--container",
            "app",
        ])
        .unwrap();

        let config = args.into_config().unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/diag.sock"));
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.default_container, "app");
        assert_eq!(config.tool, "linperf");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let args = DaemonArgs::try_parse_from(["diaginjectd", "--max-workers", "0"]).unwrap();
        assert!(args.into_config().is_err());
    }
}
