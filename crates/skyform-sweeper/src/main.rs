//! Deletes AWS resources leaked by acceptance tests.
//!
//! ```sh
//! # what would be swept in two regions
//! sweeper --sweep us-west-2,us-east-1 --dry-run
//! # sweep contacts (and, first, whatever they depend on) in one region
//! sweeper --sweep us-west-2 --sweep-run aws_ssmcontacts_contact -v
//! ```
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use sky::{
    aws::{Aws, ProviderConfig},
    sweep::{SweepConfig, DEFAULT_CONCURRENCY},
};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the verbosity level
    #[clap(short, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Regions to sweep.
    #[clap(long, env = "SWEEP", value_delimiter = ',', required = true)]
    sweep: Vec<String>,

    /// Sweepers to run, with their dependencies. Runs every sweeper when
    /// empty.
    #[clap(long, env = "SWEEP_RUN", value_delimiter = ',')]
    sweep_run: Vec<String>,

    /// Keep going when a sweeper fails, reporting every failure at the end.
    #[clap(long, env = "SWEEP_ALLOW_FAILURES")]
    sweep_allow_failures: bool,

    /// Deletes in flight at once, per sweeper.
    #[clap(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// List what would be swept without deleting anything.
    #[clap(long)]
    dry_run: bool,

    /// Only sweep resources whose name starts with this, eg. `tf-acc-test`.
    /// Sweeps everything when unset. Resources without a name, like
    /// replication sets, are always swept.
    #[clap(long)]
    name_prefix: Option<String>,

    /// Path to a JSON provider config (default tags, ignored tags).
    #[clap(long)]
    config: Option<std::path::PathBuf>,
}

impl Cli {
    fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            concurrency: self.concurrency,
            dry_run: self.dry_run,
            name_prefix: self.name_prefix.clone().filter(|prefix| !prefix.is_empty()),
        }
    }
}

#[::tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let sweep_config = cli.sweep_config();
    let Cli {
        verbosity,
        sweep,
        sweep_run,
        sweep_allow_failures,
        config,
        ..
    } = cli;

    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("sky", level)
        .filter_module("sweeper", level)
        .parse_default_env()
        .init();

    let provider_config = match config {
        Some(path) => ProviderConfig::from_json_file(&path)
            .with_context(|| format!("loading provider config {path:?}"))?,
        None => ProviderConfig::default(),
    };
    log::info!("sweeping {sweep:?} with {sweep_config:?}");

    let sweepers = sky::aws::sweepers();
    let summary = sweepers
        .run(
            &sweep,
            &sweep_run,
            sweep_allow_failures,
            &sweep_config,
            |region| {
                let provider_config = provider_config.clone().with_region(region);
                async move { Arc::new(Aws::load(provider_config).await) }
            },
        )
        .await?;

    for report in summary.reports.iter() {
        let status = if report.skipped {
            "skipped".yellow()
        } else if sweep_config.dry_run {
            format!("would delete {}", report.listed).cyan()
        } else {
            format!("deleted {}/{}", report.deleted, report.listed).green()
        };
        println!("{} ({}): {status}", report.name.bold(), report.region);
    }
    for failure in summary.failures.iter() {
        println!(
            "{} ({}): {}",
            failure.name.bold(),
            failure.region,
            failure.message.red()
        );
    }
    anyhow::ensure!(
        summary.failures.is_empty(),
        "{} sweeper(s) failed",
        summary.failures.len()
    );
    Ok(())
}
