//! # ECAT Master Binary
//!
//! Drives the fieldbus master through its states, runs the cyclic job
//! loop, and publishes process data to consumer processes through shared
//! memory.
//!
//! # Usage
//!
//! ```bash
//! # Simulated bus, default config
//! ecat_master --config config/master.toml --simulate
//!
//! # Stop at SAFEOP, verbose
//! ecat_master -c config/master.toml --state safeop -v
//!
//! # Bounded run (e.g. for smoke tests), JSON logs
//! ecat_master -c config/master.toml --simulate --cycles 5000 --json
//! ```

use clap::Parser;
use ecat_common::bus::BusState;
use ecat_common::bus::config::MasterConfig;
use ecat_common::config::{ConfigError, ConfigLoader};
use ecat_common::consts::DEFAULT_CONFIG_PATH;
use ecat_master::{MasterRegistry, Supervisor, rt};
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// ECAT Master - bus state coordinator and cyclic job runner
#[derive(Parser, Debug)]
#[command(name = "ecat_master")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Fieldbus master coordinator with shared process-data bridge")]
#[command(long_about = None)]
struct Args {
    /// Path to master configuration file (master.toml)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the requested bus state (init, preop, safeop, op)
    #[arg(long, value_name = "STATE")]
    state: Option<BusState>,

    /// Force the simulated master backend
    #[arg(short = 's', long)]
    simulate: bool,

    /// Master backend to use
    #[arg(short, long, default_value = "simulation")]
    backend: String,

    /// Stop after this many cycles
    #[arg(long, value_name = "N")]
    cycles: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    let config = MasterConfig::load(&args.config);

    let level = match (&config, args.verbose) {
        (_, true) => Level::DEBUG,
        (Ok(c), false) => c.shared.log_level.into(),
        (Err(_), false) => Level::INFO,
    };
    setup_tracing(&args, level);

    info!("ECAT Master v{} starting...", env!("CARGO_PKG_VERSION"));

    let result = config
        .map_err(|e| config_error(&args, e))
        .and_then(|config| run(&args, config));
    if let Err(e) = result {
        error!("FATAL: {e}");
        std::process::exit(1);
    }
}

fn config_error(args: &Args, e: ConfigError) -> Box<dyn Error> {
    format!("{}: {e}", args.config.display()).into()
}

fn run(args: &Args, mut config: MasterConfig) -> Result<(), Box<dyn Error>> {
    if let Some(state) = args.state {
        info!(%state, "Requested state overridden from command line");
        config.bus.requested_state = state;
    }
    config.validate()?;
    info!(
        service = %config.shared.service_name,
        slaves = config.slaves.len(),
        period_us = config.cycle.period_us,
        timing = ?config.cycle.timing,
        "Configuration loaded from {}",
        args.config.display()
    );

    rt::lock_memory()?;

    let backend = if args.simulate {
        info!("Simulation mode enabled");
        "simulation"
    } else {
        args.backend.as_str()
    };
    let registry = MasterRegistry::with_builtin();
    let master = registry.create_master(backend, &config)?;

    let mut supervisor = Supervisor::new(config, master)?;

    let running = supervisor.running_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    supervisor.run(args.cycles)?;

    info!("ECAT Master shutdown complete");
    Ok(())
}

/// Setup tracing subscriber from CLI flags and the configured level.
fn setup_tracing(args: &Args, level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
