//! Headless yard simulator: drives the automaton against the PLC and streams telemetry.
//!
//! Console: `m` toggle mode, `t` toggle turnout, `r` reset, `q` quit.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;

use railway_ot_lab::rail::adapters::storage::load_config_or_default;
use railway_ot_lab::rail::usecase::simulator::{build_link, build_sink, run_console, spawn_simulator};

#[derive(Parser, Debug)]
#[command(name = "rail_sim", about = "Rail yard simulator (Modbus TCP client + UDP telemetry)")]
struct Args {
    /// Lab config file (lab.v1.json); missing file means defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override simulator.plcAddr (point it at the gateway to go through the proxy)
    #[arg(long)]
    plc: Option<String>,

    /// Override simulator.telemetryAddr
    #[arg(long)]
    telemetry: Option<String>,

    /// Disable telemetry output
    #[arg(long)]
    no_telemetry: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config =
        load_config_or_default(args.config.as_deref()).context("failed to load lab config")?;
    if let Some(plc) = args.plc {
        config.simulator.plc_addr = plc;
    }
    if let Some(telemetry) = args.telemetry {
        config.simulator.telemetry_addr = Some(telemetry);
    }
    if args.no_telemetry {
        config.simulator.telemetry_addr = None;
    }

    let link = build_link(&config.simulator)?;
    let sink = build_sink(&config.simulator).await?;
    let handle = spawn_simulator(&config.simulator, link, sink);
    log::info!(
        "[sim] PLC {} telemetry {}",
        config.simulator.plc_addr,
        config.simulator.telemetry_addr.as_deref().unwrap_or("off")
    );
    log::info!("[sim] console: m = mode, t = turnout, r = reset, q = quit");

    let commands = handle.commands();
    let console = async move {
        match run_console(BufReader::new(tokio::io::stdin()), commands).await {
            Ok(true) => {}
            // stdin closed: keep running until ctrl-c
            Ok(false) => std::future::pending::<()>().await,
            Err(err) => {
                log::warn!("[sim] console failed: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        () = console => {}
    }

    log::info!("[sim] shutting down");
    handle.stop().await;
    Ok(())
}
