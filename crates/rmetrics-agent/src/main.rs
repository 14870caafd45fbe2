//! rmetrics-agent - runtime metrics agent.
//!
//! Samples allocator statistics of its own process on the poll interval and
//! pushes them to the collector on the report interval.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod pipeline;
mod stats;

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use rmetrics_core::collector::Sampler;
use rmetrics_core::sender::{RetryPolicy, Sender, SenderConfig};

use stats::JemallocStats;

/// Runtime metrics agent.
#[derive(Parser)]
#[command(name = "rmetrics-agent", about = "Runtime metrics agent", version = rmetrics_core::VERSION)]
struct Args {
    /// Collector address.
    #[arg(short, long, default_value = "localhost:8080", env = "ADDRESS")]
    address: String,

    /// Sampling interval in seconds.
    #[arg(short, long, default_value = "2", env = "POLL_INTERVAL")]
    poll_interval: u64,

    /// Report interval in seconds.
    #[arg(short, long, default_value = "10", env = "REPORT_INTERVAL")]
    report_interval: u64,

    /// Shared secret for HashSHA256 body signatures.
    #[arg(short, long, env = "KEY")]
    key: Option<String>,

    /// Delivery attempts per batch.
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds.
    #[arg(long, default_value = "1000")]
    retry_delay: u64,

    /// Increase of the delay after each further failed attempt, in milliseconds.
    #[arg(long, default_value = "2000")]
    retry_step: u64,

    /// Per-request timeout in seconds.
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Batches waiting for delivery before new ones are dropped.
    #[arg(long, default_value = "4")]
    queue_size: usize,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            address: self.address.clone(),
            key: self.key.clone().filter(|k| !k.is_empty()),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_delay),
                step: Duration::from_millis(self.retry_step),
            },
            timeout: Duration::from_secs(self.timeout),
        }
    }
}

/// How long loops get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

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
    process::exit(code);
}

/// Initializes the tracing subscriber. `RUST_LOG` wins when set.
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
        EnvFilter::new(format!("rmetrics_agent={level},rmetrics_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Flips `shutdown` on SIGINT, SIGTERM or SIGHUP.
fn install_signal_handler(shutdown: Arc<watch::Sender<bool>>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        let _ = shutdown.send(true);
    })
}

async fn async_main(args: Args) -> i32 {
    if args.poll_interval == 0 || args.report_interval == 0 {
        error!("poll and report intervals must be positive");
        return 1;
    }

    let config = args.sender_config();
    info!(
        version = rmetrics_core::VERSION,
        collector = %config.base_url(),
        poll_interval_secs = args.poll_interval,
        report_interval_secs = args.report_interval,
        max_attempts = config.retry.max_attempts,
        signed = config.key.is_some(),
        "rmetrics-agent starting"
    );

    let sender = match Sender::new(config) {
        Ok(sender) => Arc::new(sender),
        Err(e) => {
            error!(error = %e, "failed to create HTTP client");
            return 1;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    if let Err(e) = install_signal_handler(shutdown_tx.clone()) {
        warn!("Failed to set signal handler: {}", e);
    }

    let sampler = Arc::new(Mutex::new(Sampler::new(JemallocStats::new())));
    let (queue_tx, queue_rx) = mpsc::channel(args.queue_size.max(1));

    let tasks = vec![
        tokio::spawn(pipeline::poll_loop(
            sampler.clone(),
            Duration::from_secs(args.poll_interval),
            shutdown_rx.clone(),
        )),
        tokio::spawn(pipeline::report_loop(
            sampler,
            Duration::from_secs(args.report_interval),
            queue_tx,
            shutdown_rx.clone(),
        )),
        tokio::spawn(pipeline::delivery_loop(
            sender,
            queue_rx,
            shutdown_rx.clone(),
        )),
    ];

    let mut stop = shutdown_rx;
    let _ = stop.wait_for(|stop| *stop).await;

    let mut code = 0;
    for task in tasks {
        let abort = task.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "agent task failed");
                code = 1;
            }
            Err(_) => {
                warn!("agent task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
    drop(shutdown_tx);
    info!("rmetrics-agent stopped");
    code
}
