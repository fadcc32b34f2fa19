//! Trainer binary: bring the stable up, train for a while, stop clean.
//!
//! Options: --minutes, --budget, --config, --report

use clap::Parser;
use robochess::config::Config;
use robochess::coordinator::Coordinator;
use robochess::learner::Registry;
use robochess::quality::Reporter;
use robochess::save::Vault;
use robochess::selfplay::Driver;
use std::sync::Arc;

#[derive(Parser)]
#[command(about = "train the chess learner stable")]
struct Args {
    /// wall-clock budget for this run
    #[arg(long, default_value_t = 30)]
    minutes: u64,
    /// per-learner episode budget
    #[arg(long, default_value_t = 10_000)]
    budget: u64,
    /// JSON config file; environment variables otherwise
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// print a quality report after the run
    #[arg(long, default_value_t = false)]
    report: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    robochess::init(config.level());
    log::info!("state directory: {}", config.state_dir.display());
    let vault = Arc::new(Vault::new(&config.state_dir, config.async_io)?);
    let driver = Arc::new(Driver::with_book(Arc::new(
        robochess::chess::Book::default(),
    )));
    let learners = Registry::stable(&config, &vault);
    let coordinator = Coordinator::new(&config, learners, vault.clone(), driver);
    coordinator.start_training(args.budget);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(args.minutes * 60);
    while std::time::Instant::now() < deadline && coordinator.active() {
        std::thread::sleep(std::time::Duration::from_secs(5));
        for (kind, metrics) in coordinator.metrics() {
            log::debug!(
                "{}: {} episodes, {} steps",
                kind,
                metrics.episodes(),
                metrics.get("steps"),
            );
        }
    }
    coordinator.shutdown();
    if args.report {
        let report = Reporter::assess(&coordinator, &vault);
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
