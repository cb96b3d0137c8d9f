//! Worker process: one sandbox context driven over stdin/stdout.
//!
//! Logs go to stderr, which the parent forwards into its own tracing output.

use anyhow::Result;
use clap::Parser;
use jsbox_kernel::worker::{run_stdio, WorkerOptions};
use jsbox_kernel::DEFAULT_CAPTURE_CAPACITY;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "jsbox-worker")]
#[command(about = "JavaScript sandbox worker (spawned by the jsbox kernel)")]
struct Args {
    /// Maximum number of output events kept per run
    #[arg(long, default_value_t = DEFAULT_CAPTURE_CAPACITY)]
    capacity: usize,

    /// Directory require() resolves modules against
    #[arg(long)]
    module_root: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "jsbox_worker={},jsbox_kernel={}",
                    log_level, log_level
                ))
            }),
        )
        .init();

    run_stdio(WorkerOptions {
        capture_capacity: args.capacity,
        module_root: args.module_root,
    })
    .await
}
