//! Attach to a running master's bridge and print one variable per cycle.
//!
//! ```bash
//! cargo run -p ecat_shared_memory --example pdo_monitor -- --slave EL3102 --var Status
//! ```

use clap::Parser;
use ecat_common::bus::config::BridgeConfig;
use ecat_shared_memory::{ProcessDataBridge, ShmResult, consumer_identity};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pdo_monitor", about = "Print bus state and one variable each cycle")]
struct Args {
    /// Snapshot segment name
    #[arg(long, default_value = ecat_common::consts::DEFAULT_SEGMENT_NAME)]
    segment: String,

    /// Semaphore base name
    #[arg(long, default_value = ecat_common::consts::DEFAULT_SEMAPHORE_BASE)]
    semaphore_base: String,

    /// Number of semaphores in the pool
    #[arg(long, default_value_t = ecat_common::consts::MAX_CONSUMERS)]
    semaphores: usize,

    /// Slave display name
    #[arg(long)]
    slave: String,

    /// Variable name (u16)
    #[arg(long)]
    var: String,

    /// Print every Nth cycle
    #[arg(long, default_value_t = 1000)]
    every: u64,
}

fn main() -> ShmResult<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    let mut config = BridgeConfig::named(&args.segment, &args.semaphore_base);
    config.semaphore_count = args.semaphores;
    let bridge = ProcessDataBridge::open(&config)?;
    let me = consumer_identity();
    let slot = bridge.register(me)?;
    info!(segment = %args.segment, slot, "Attached");

    let mut seen = 0u64;
    loop {
        if !bridge.wait_timeout(me, Duration::from_secs(2))? {
            warn!("No cycle for 2 s");
            continue;
        }
        seen += 1;
        if seen % args.every != 0 {
            continue;
        }
        let snap = bridge.snapshot();
        let Some(index) = bridge.slave_index(&args.slave) else {
            warn!(slave = %args.slave, "Slave not in directory");
            continue;
        };
        match bridge.get_value::<u16>(index, &args.var) {
            Ok(value) => info!(
                state = %snap.current_state(),
                cycle = snap.cycle_count.load(Ordering::Relaxed),
                avg_us = snap.avg_cycle_ns.load(Ordering::Relaxed) / 1000,
                value = %format!("{value:#06x}"),
                "{}.{}", args.slave, args.var
            ),
            Err(e) => warn!(error = %e, "Read failed"),
        }
    }
}
