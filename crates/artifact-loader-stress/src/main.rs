use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use artifact_loader::Config;
use artifact_loader::logging::{ensure_log_error, init_logging};
use artifact_loader::metrics;
use clap::Parser;

use crate::stresstest::perform_stresstest;
use crate::workloads::WorkloadsConfig;

mod stresstest;
mod workloads;

/// Hammers an artifact loader with synthetic workloads and reports throughput and latencies.
#[derive(Parser, Debug)]
#[command(about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,
}

fn main() {
    if let Err(error) = run() {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::get(cli.config.as_deref())?;
    let workloads = WorkloadsConfig::get(&cli.workloads)?;

    // SAFETY: no other threads are running yet.
    unsafe { init_logging(&config.logging) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("stresstest")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))
}
