//! inspectd - Kubernetes inspection service daemon.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use inspectd::{Daemon, DaemonConfig};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "inspectd", about = "Kubernetes inspection service daemon", version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "INSPECTD_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "INSPECTD_PORT")]
    port: Option<u16>,

    /// SQLite database path (overrides the config file)
    #[arg(long, env = "INSPECTD_DB_PATH")]
    db_path: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match DaemonConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut sigterm = signal(SignalKind::terminate())
                        .expect("failed to register SIGTERM handler");
                    let mut sigint =
                        signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

                    tokio::select! {
                        result = daemon.run() => {
                            if let Err(e) = result {
                                error!("daemon error: {e}");
                            }
                        }
                        _ = sigint.recv() => {
                            tracing::info!("received SIGINT, shutting down");
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, shutting down");
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    tokio::select! {
                        result = daemon.run() => {
                            if let Err(e) = result {
                                error!("daemon error: {e}");
                            }
                        }
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("received SIGINT, shutting down");
                        }
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}
