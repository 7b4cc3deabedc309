use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use tsod::config::{self, Config};
use tsod::service::clock::SystemClockSource;
use tsod::service::consensus::{ClusterHandle, InMemoryConsensus};
use tsod::{Service, telemetry};

#[derive(Parser)]
#[command(name = "tsod", about = "Clustered timestamp oracle service")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of cores to bind (overrides the config file).
    #[arg(long)]
    cores: Option<usize>,
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let mut cfg = config::load_or_default(cli.config.as_deref());
    config::apply_env_overrides(&mut cfg);
    if let Some(cores) = cli.cores {
        cfg.cores = Some(cores);
    }
    telemetry::init(cli.verbose, &cfg.logging);

    if let Err(e) = run(cfg) {
        tracing::error!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cfg: Config) -> tsod::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());

    // Standalone mode: an in-process consensus store and the system clock
    // stand in for the external collaborators.
    let cluster = ClusterHandle::new();
    let service = Service::start(
        &cfg,
        Box::new(InMemoryConsensus::new(cluster)),
        Box::new(SystemClockSource::default()),
    )?;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("shutdown signal received");
            return service.stop();
        }
        if service.controller_finished() {
            // lost lease or crash; join surfaces the verdict
            return service.join();
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
