use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use epochcache::config::Config;

mod logging;
mod stresstest;
mod workloads;

use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Drives synthetic workloads against memoized producers.
#[derive(Parser, Debug)]
#[command(author, version, about)]
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

    /// Report errors and transactions to a local sentry sink.
    #[arg(long)]
    sentry: bool,

    /// Format all logs like production does, and discard them.
    ///
    /// Otherwise, logs are printed as the config file says.
    #[arg(long)]
    tracing: bool,

    /// Send metrics to a local statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run() {
        epochcache::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let service_config = Config::get(cli.config.as_deref())?;

    // SAFETY: No other threads exist yet.
    let mut logging_guard = unsafe {
        logging::init(logging::Config {
            backtraces: true,
            sentry: cli.sentry,
            tracing: cli.tracing,
            metrics: cli.metrics,
        })
    }?;
    // Without the local sinks, report wherever the config file says.
    let _sentry = (!cli.sentry).then(|| {
        sentry::init(sentry::ClientOptions {
            dsn: service_config.sentry_dsn.clone(),
            release: sentry::release_name!(),
            ..Default::default()
        })
    });
    if !cli.tracing {
        // SAFETY: No other threads exist yet.
        unsafe { epochcache::logging::init_logging(&service_config) };
    }
    if let (false, Some(statsd)) = (cli.metrics, &service_config.metrics.statsd) {
        epochcache::metrics::configure_statsd(
            &service_config.metrics.prefix,
            statsd.as_str(),
            service_config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async move {
        if let Some(http_sink) = logging_guard.http_sink.take() {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        stresstest::perform_stresstest(service_config, workloads, cli.duration).await
    })
}
