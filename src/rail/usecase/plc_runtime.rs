//! PLC 运行时：后台周期扫描（scan loop）+ 状态行日志。
//!
//! - `start` 启动一个 tokio 任务，按 `scanIntervalMs` 调用联锁扫描；重复 start 返回已有 run id
//! - 扫描失败记 error 日志，下个周期继续
//! - `stop` 通过 watch 通知退出并等待任务结束

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::rail::core::interlocking::{scan_once, ScanOutcome};
use crate::rail::core::model::{address, bit, PlcConfig};
use crate::rail::core::store::{RegisterStore, StoreError};
use crate::rail::error::LabError;

#[derive(Clone, Debug, PartialEq)]
pub struct ScanStats {
    pub cycles: u64,
    pub failures: u64,
    pub last_outcome: Option<ScanOutcome>,
    pub updated_at_utc: DateTime<Utc>,
}

struct ScanHandle {
    run_id: Uuid,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    latest: Arc<Mutex<ScanStats>>,
}

pub struct PlcRuntime {
    store: Arc<RegisterStore>,
    run: Mutex<Option<ScanHandle>>,
}

impl PlcRuntime {
    pub fn new(store: Arc<RegisterStore>) -> Self {
        Self {
            store,
            run: Mutex::new(None),
        }
    }

    /// Store sized from config with power-on defaults applied.
    pub fn from_config(config: &PlcConfig) -> Result<Self, LabError> {
        let store = RegisterStore::with_defaults(config.coil_capacity, config.register_capacity)?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    pub fn start(&self, scan_interval: Duration, status_interval: Duration) -> Uuid {
        let mut run = self.run.lock();
        if let Some(handle) = run.as_ref() {
            return handle.run_id;
        }

        let run_id = Uuid::new_v4();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let latest = Arc::new(Mutex::new(ScanStats {
            cycles: 0,
            failures: 0,
            last_outcome: None,
            updated_at_utc: Utc::now(),
        }));

        let latest_for_task = Arc::clone(&latest);
        let store = Arc::clone(&self.store);
        let join = tokio::spawn(async move {
            log::info!("[plc] scan loop {run_id} started ({} ms)", scan_interval.as_millis());
            let mut ticker = tokio::time::interval(scan_interval.max(Duration::from_millis(1)));
            let mut last_status: Option<Instant> = None;

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let outcome = scan_once(&store);
                        {
                            let mut guard = latest_for_task.lock();
                            guard.cycles += 1;
                            guard.updated_at_utc = Utc::now();
                            match &outcome {
                                Ok(outcome) => guard.last_outcome = Some(*outcome),
                                Err(_) => guard.failures += 1,
                            }
                        }
                        if let Err(err) = outcome {
                            log::error!("[plc] scan failed: {err}");
                        }

                        let due = last_status.map_or(true, |at| at.elapsed() >= status_interval);
                        if due {
                            last_status = Some(Instant::now());
                            match status_line(&store) {
                                Ok(line) => log::info!("[plc] {line}"),
                                Err(err) => log::error!("[plc] status read failed: {err}"),
                            }
                        }
                    }
                }
            }
            log::info!("[plc] scan loop {run_id} stopped");
        });

        *run = Some(ScanHandle {
            run_id,
            stop_tx,
            join,
            latest,
        });
        run_id
    }

    pub fn stats(&self) -> Option<ScanStats> {
        let latest = {
            let guard = self.run.lock();
            guard.as_ref().map(|h| Arc::clone(&h.latest))
        }?;
        let snapshot = latest.lock().clone();
        Some(snapshot)
    }

    pub async fn stop(&self) -> bool {
        let handle = self.run.lock().take();
        let Some(handle) = handle else {
            return false;
        };

        let _ = handle.stop_tx.send(true);
        let _ = handle.join.await;
        true
    }
}

/// One-line summary of the interlocking state, e.g.
/// `mode=AUTO occ A=1 B=0 C=0 crash=0 turnout_main=1 estop=0 sig AB=0 BC=1 SB=0`.
pub fn status_line(store: &RegisterStore) -> Result<String, StoreError> {
    let mode = store.register(address::HR_MODE)?;
    let inputs = store.read_registers(address::HR_IN_OCC_A, 4)?;
    let signals = store.read_registers(address::HR_SIG_AB, 3)?;
    let coils = store.read_coils(address::CO_TURNOUT_MAIN, 2)?;

    Ok(format!(
        "mode={} occ A={} B={} C={} crash={} turnout_main={} estop={} sig AB={} BC={} SB={}",
        if bit(mode) == 1 { "SCADA" } else { "AUTO" },
        bit(inputs[0]),
        bit(inputs[1]),
        bit(inputs[2]),
        bit(inputs[3]),
        u8::from(coils[0]),
        u8::from(coils[1]),
        bit(signals[0]),
        bit(signals[1]),
        bit(signals[2]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_reports_every_field() {
        let store = RegisterStore::with_defaults(200, 300).unwrap();
        store.write_registers(address::HR_IN_OCC_A, &[0, 1, 0, 0]).unwrap();
        store.write_registers(address::HR_SIG_AB, &[0, 1, 0]).unwrap();

        assert_eq!(
            status_line(&store).unwrap(),
            "mode=AUTO occ A=0 B=1 C=0 crash=0 turnout_main=1 estop=0 sig AB=0 BC=1 SB=0"
        );
    }

    #[tokio::test]
    async fn scan_loop_applies_interlocking_until_stopped() {
        let runtime = PlcRuntime::from_config(&PlcConfig::default()).unwrap();
        let store = Arc::clone(runtime.store());
        store.set_register(address::HR_IN_CRASH, 1).unwrap();

        let run_id = runtime.start(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(
            runtime.start(Duration::from_millis(10), Duration::from_secs(1)),
            run_id
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.coil(address::CO_ESTOP).unwrap());
        let stats = runtime.stats().unwrap();
        assert!(stats.cycles >= 1);
        assert_eq!(stats.last_outcome, Some(ScanOutcome::CrashStop));

        assert!(runtime.stop().await);
        assert!(!runtime.is_running());
        assert!(!runtime.stop().await);

        // no scan after stop: crash clear does not release the estop
        store.set_register(address::HR_IN_CRASH, 0).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.coil(address::CO_ESTOP).unwrap());
    }

    #[tokio::test]
    async fn failed_scans_are_counted_and_the_loop_keeps_running() {
        let runtime = PlcRuntime::new(Arc::new(RegisterStore::new(2, 60)));
        runtime.start(Duration::from_millis(10), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = runtime.stats().unwrap();
        assert!(stats.failures >= 2);
        assert_eq!(stats.failures, stats.cycles);
        assert!(runtime.stop().await);
    }
}
