//! rmetrics-server - metrics collector.
//!
//! Accepts gauge and counter updates over HTTP, keeps the latest state in the
//! configured storage backend and answers point lookups.

mod app;
mod background;
mod handlers;
mod middleware;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{Instrument, Level, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use rmetrics_core::service::MetricService;
use rmetrics_core::storage::{self, MetricStorage, StorageConfig};

use state::{AppState, SigningKey};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "rmetrics-server", about = "Metrics collector server", version = rmetrics_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(short, long, default_value = "localhost:8080", env = "ADDRESS")]
    address: String,

    /// Snapshot interval in seconds. 0 writes the snapshot after every update.
    #[arg(short = 'i', long, default_value = "300", env = "STORE_INTERVAL")]
    store_interval: u64,

    /// Snapshot file path. Enables the file backend.
    #[arg(short, long, env = "FILE_STORAGE_PATH")]
    file_storage_path: Option<PathBuf>,

    /// Load the previous snapshot at startup. Disable with --restore=false.
    #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set, env = "RESTORE")]
    restore: bool,

    /// PostgreSQL connection string. Used when no snapshot file is configured.
    #[arg(short, long, env = "DATABASE_DSN")]
    database_dsn: Option<String>,

    /// Shared secret for HashSHA256 body signatures.
    #[arg(short, long, env = "KEY")]
    key: Option<String>,

    /// Seconds to wait for in-flight requests on shutdown.
    #[arg(long, default_value = "10")]
    shutdown_timeout: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    let code = runtime.block_on(async_main(args));
    runtime.shutdown_timeout(Duration::from_secs(1));
    process::exit(code);
}

/// `RUST_LOG` wins when set; otherwise -v/-q pick the level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("rmetrics_server={level},rmetrics_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn async_main(args: Args) -> i32 {
    let store_interval = Duration::from_secs(args.store_interval);
    let storage_config = StorageConfig::select(
        args.file_storage_path.clone(),
        args.restore,
        store_interval,
        args.database_dsn.clone(),
    );
    info!(
        version = rmetrics_core::VERSION,
        address = %args.address,
        store_interval_secs = args.store_interval,
        restore = args.restore,
        signed = args.key.is_some(),
        "starting"
    );

    let storage = {
        let config = storage_config.clone();
        match tokio::task::spawn_blocking(move || storage::open(&config)).await {
            Ok(Ok(storage)) => storage,
            Ok(Err(e)) => {
                error!(error = %e, "failed to open storage");
                return 1;
            }
            Err(e) => {
                error!(error = %e, "storage open panicked");
                return 1;
            }
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let snapshot_task = match storage_config {
        StorageConfig::File {
            sync_writes: false, ..
        } => Some(tokio::spawn(
            background::snapshot_loop(storage.clone(), store_interval, shutdown_rx.clone())
                .instrument(info_span!("snapshot")),
        )),
        _ => None,
    };

    let key = args
        .key
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(SigningKey::new);
    let state = AppState::new(MetricService::new(storage.clone()));
    let app = app::build_router(state, key).into_make_service_with_connect_info::<SocketAddr>();

    let listener = match tokio::net::TcpListener::bind(&args.address).await {
        Ok(l) => l,
        Err(e) => {
            error!(address = %args.address, error = %e, "failed to bind");
            close_storage(storage).await;
            return 1;
        }
    };
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "listening"),
        Err(_) => info!(address = %args.address, "listening"),
    }

    let mut server_rx = shutdown_rx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    let mut code = 0;
    tokio::select! {
        result = &mut server => {
            error!(result = ?result, "server stopped unexpectedly");
            code = 1;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if !server.is_finished() {
        let grace = Duration::from_secs(args.shutdown_timeout);
        match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Ok(()))) => info!("in-flight requests drained"),
            Ok(Ok(Err(e))) => {
                error!(error = %e, "server error during shutdown");
                code = 1;
            }
            Ok(Err(e)) => {
                error!(error = %e, "server task failed");
                code = 1;
            }
            Err(_) => {
                warn!(timeout_secs = args.shutdown_timeout, "shutdown timeout, dropping connections");
                server.abort();
            }
        }
    }

    if let Some(task) = snapshot_task {
        let _ = task.await;
    }
    if !close_storage(storage).await {
        code = 1;
    }
    info!("stopped");
    code
}

/// Final flush and release of the backend. The last reference is dropped on
/// the blocking pool: the PostgreSQL client must not be dropped on a runtime
/// thread.
async fn close_storage(storage: Arc<dyn MetricStorage>) -> bool {
    let result = tokio::task::spawn_blocking(move || {
        let result = storage.close();
        drop(storage);
        result
    })
    .await;
    match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "failed to close storage");
            false
        }
        Err(e) => {
            error!(error = %e, "storage close panicked");
            false
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::parse_from(["rmetrics-server"]);
        assert_eq!(args.store_interval, 300);
        assert!(args.restore);
        assert_eq!(args.shutdown_timeout, 10);
    }

    #[test]
    fn restore_can_be_disabled() {
        let args = Args::parse_from(["rmetrics-server", "-r", "false", "-i", "0", "-f", "/tmp/m.json"]);
        assert!(!args.restore);
        assert_eq!(args.store_interval, 0);
        assert_eq!(args.file_storage_path, Some(PathBuf::from("/tmp/m.json")));
    }
}
