//! Interlocking PLC: register store served over Modbus TCP plus the scan loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use railway_ot_lab::rail::adapters::server::PlcServer;
use railway_ot_lab::rail::adapters::storage::{load_config_or_default, save_config};
use railway_ot_lab::rail::usecase::plc_runtime::PlcRuntime;

#[derive(Parser, Debug)]
#[command(name = "plc_server", about = "Railway interlocking PLC (Modbus TCP server + scan loop)")]
struct Args {
    /// Lab config file (lab.v1.json); missing file means defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override plc.bindAddr
    #[arg(long)]
    bind: Option<String>,

    /// Override plc.scanIntervalMs
    #[arg(long)]
    scan_ms: Option<u64>,

    /// Write the effective config to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config =
        load_config_or_default(args.config.as_deref()).context("failed to load lab config")?;
    if let Some(bind) = args.bind {
        config.plc.bind_addr = bind;
    }
    if let Some(scan_ms) = args.scan_ms {
        config.plc.scan_interval_ms = scan_ms;
    }
    if let Some(path) = args.write_config {
        save_config(&path, &config)
            .with_context(|| format!("failed to write {}", path.display()))?;
        log::info!("[plc] config written to {}", path.display());
        return Ok(());
    }

    let runtime = PlcRuntime::from_config(&config.plc)?;
    let server = PlcServer::bind(
        &config.plc.bind_addr,
        runtime.store().clone(),
        config.plc.unit_id,
    )
        .await
        .with_context(|| format!("failed to bind {}", config.plc.bind_addr))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(stop_rx));
    let run_id = runtime.start(
        Duration::from_millis(config.plc.scan_interval_ms),
        Duration::from_millis(config.plc.status_interval_ms),
    );
    log::info!("[plc] run {run_id} up, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    log::info!("[plc] shutting down");
    let _ = stop_tx.send(true);
    runtime.stop().await;
    let _ = server_task.await;
    Ok(())
}
