//! On-path gateway between the simulator and the PLC.
//!
//! Rewrites writes to the protected register and injects forced values from the console:
//! `g` proceed, `r` stop, `q` close the console (relaying continues until ctrl-c).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::watch;

use railway_ot_lab::rail::adapters::proxy::{run_console, Gateway};
use railway_ot_lab::rail::adapters::storage::load_config_or_default;

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "Modbus TCP frame-rewrite gateway with injection console")]
struct Args {
    /// Lab config file (lab.v1.json); missing file means defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override gateway.listenAddr
    #[arg(long)]
    listen: Option<String>,

    /// Override gateway.upstreamAddr
    #[arg(long)]
    upstream: Option<String>,

    /// Override gateway.protectedRegister
    #[arg(long)]
    register: Option<u16>,

    /// Override gateway.forcedValue
    #[arg(long)]
    value: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config =
        load_config_or_default(args.config.as_deref()).context("failed to load lab config")?;
    if let Some(listen) = args.listen {
        config.gateway.listen_addr = listen;
    }
    if let Some(upstream) = args.upstream {
        config.gateway.upstream_addr = upstream;
    }
    if let Some(register) = args.register {
        config.gateway.protected_register = register;
    }
    if let Some(value) = args.value {
        config.gateway.forced_value = value;
    }

    let gateway = Gateway::bind(&config.gateway)
        .await
        .with_context(|| format!("failed to start gateway on {}", config.gateway.listen_addr))?;
    let injector = gateway.injector();

    let (stop_tx, stop_rx) = watch::channel(false);
    let serve_task = tokio::spawn(gateway.serve(stop_rx));
    log::info!("[gateway] console: g = proceed, r = stop, q = close console");

    tokio::spawn(async move {
        if let Err(err) = run_console(BufReader::new(tokio::io::stdin()), injector).await {
            log::warn!("[gateway] console failed: {err}");
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("[gateway] shutting down");
    let _ = stop_tx.send(true);
    let _ = serve_task.await;
    Ok(())
}
