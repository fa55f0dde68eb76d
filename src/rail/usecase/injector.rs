//! 直写注入器：不经过 gateway，直接连 PLC 周期性写一个保持寄存器（默认 SigBC = 1）。
//!
//! - 连不上：等 `retry_delay` 后重连
//! - 写失败：计数并记日志，下个周期先重连再写
//! - `stop` 变为 true 或发送端被 drop 时退出

use std::time::Duration;

use tokio::sync::watch;

use crate::rail::core::link::PlcLink;
use crate::rail::core::model::address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForceSettings {
    pub register: u16,
    pub value: u16,
    pub interval: Duration,
    pub retry_delay: Duration,
}

impl Default for ForceSettings {
    fn default() -> Self {
        Self {
            register: address::HR_SIG_BC,
            value: 1,
            interval: Duration::from_millis(100),
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForceStats {
    pub writes: u64,
    pub failures: u64,
    pub connects: u64,
}

pub async fn run_forcing(
    link: &mut dyn PlcLink,
    settings: ForceSettings,
    mut stop: watch::Receiver<bool>,
) -> ForceStats {
    let mut stats = ForceStats::default();
    log::info!(
        "[injector] forcing register {} = {} every {} ms",
        settings.register,
        settings.value,
        settings.interval.as_millis()
    );

    loop {
        if *stop.borrow() {
            break;
        }

        let delay = if link.is_connected() || connect(link, &mut stats).await {
            match link
                .write_registers(settings.register, &[settings.value])
                .await
            {
                Ok(()) => {
                    stats.writes += 1;
                    log::debug!(
                        "[injector] register {} forced to {}",
                        settings.register,
                        settings.value
                    );
                }
                Err(err) => {
                    stats.failures += 1;
                    log::warn!("[injector] write failed: {err}");
                }
            }
            settings.interval
        } else {
            settings.retry_delay
        };

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    link.disconnect();
    log::info!(
        "[injector] stopped after {} writes ({} failed)",
        stats.writes,
        stats.failures
    );
    stats
}

async fn connect(link: &mut dyn PlcLink, stats: &mut ForceStats) -> bool {
    match link.connect().await {
        Ok(()) => {
            stats.connects += 1;
            log::info!("[injector] connected to PLC");
            true
        }
        Err(err) => {
            log::warn!("[injector] PLC not reachable ({err}), retrying");
            false
        }
    }
}
