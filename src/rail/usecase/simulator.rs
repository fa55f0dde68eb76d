//! 仿真驱动：按 `tickHz` 推进模式仲裁状态机，按 `telemetryHz` 输出遥测。
//!
//! 操作员命令通过 mpsc 进入任务，在下一个 tick 执行；最新快照放在共享槽里供调用方查询。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::rail::adapters::link::modbus_tcp::ModbusTcpLink;
use crate::rail::adapters::telemetry::{unix_seconds, NullSink, TelemetrySink, UdpTelemetrySink};
use crate::rail::core::automaton::{Automaton, AutomatonTiming, OperatorCommand, YardSnapshot};
use crate::rail::core::link::PlcLink;
use crate::rail::core::model::SimulatorConfig;
use crate::rail::error::LabError;

const COMMAND_QUEUE: usize = 32;
const MAX_HZ: u32 = 1000;

/// 0 Hz 和超大频率都会让 `interval` 拿到非法周期，这里夹到 1..=1000 Hz。
fn period(hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(hz.clamp(1, MAX_HZ)))
}

pub struct SimulatorHandle {
    commands: mpsc::Sender<OperatorCommand>,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    latest: Arc<Mutex<Option<YardSnapshot>>>,
}

impl SimulatorHandle {
    pub fn commands(&self) -> mpsc::Sender<OperatorCommand> {
        self.commands.clone()
    }

    pub fn latest(&self) -> Option<YardSnapshot> {
        self.latest.lock().clone()
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

/// Real Modbus link towards `plcAddr`.
pub fn build_link(config: &SimulatorConfig) -> Result<Box<dyn PlcLink>, LabError> {
    Ok(Box::new(ModbusTcpLink::from_config(config)?))
}

/// UDP sink when `telemetryAddr` is set, otherwise a no-op sink.
pub async fn build_sink(config: &SimulatorConfig) -> Result<Box<dyn TelemetrySink>, LabError> {
    match &config.telemetry_addr {
        Some(addr) => Ok(Box::new(UdpTelemetrySink::connect(addr).await?)),
        None => Ok(Box::new(NullSink)),
    }
}

pub fn spawn_simulator(
    config: &SimulatorConfig,
    mut link: Box<dyn PlcLink>,
    mut sink: Box<dyn TelemetrySink>,
) -> SimulatorHandle {
    let run_id = Uuid::new_v4();
    let timing = AutomatonTiming::from_config(config);
    let tick_period = period(config.tick_hz);
    let telemetry_period = period(config.telemetry_hz);

    let (commands, mut command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let latest = Arc::new(Mutex::new(None));
    let latest_for_task = Arc::clone(&latest);

    let join = tokio::spawn(async move {
        log::info!(
            "[sim] run {run_id} started ({} Hz tick, {} ms blackout)",
            (1.0 / tick_period.as_secs_f64()).round(),
            timing.blackout.as_millis()
        );
        let mut automaton = Automaton::new(timing, Instant::now());
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_telemetry: Option<Instant> = None;
        let mut comms_were_on = false;

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                Some(command) = command_rx.recv() => {
                    automaton.command(command);
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let report = automaton.advance(now, link.as_mut()).await;
                    if report.comms_enabled != comms_were_on {
                        comms_were_on = report.comms_enabled;
                        log::info!("[sim] comms {}", if comms_were_on { "ON" } else { "OFF (blackout)" });
                    }

                    let due = last_telemetry.map_or(true, |at| now.saturating_duration_since(at) >= telemetry_period);
                    if due {
                        last_telemetry = Some(now);
                        let snapshot = automaton.snapshot(now, unix_seconds(Utc::now()));
                        sink.publish(&snapshot);
                        *latest_for_task.lock() = Some(snapshot);
                    }
                }
            }
        }

        link.disconnect();
        log::info!("[sim] run {run_id} stopped");
    });

    SimulatorHandle {
        commands,
        stop_tx,
        join,
        latest,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(OperatorCommand),
    Quit,
}

/// `m` mode, `t` turnout, `r` reset, `q` quit.
pub fn parse_console_input(line: &str) -> Option<ConsoleInput> {
    match line.trim().to_ascii_lowercase().as_str() {
        "m" => Some(ConsoleInput::Command(OperatorCommand::ToggleMode)),
        "t" => Some(ConsoleInput::Command(OperatorCommand::ToggleTurnout)),
        "r" => Some(ConsoleInput::Command(OperatorCommand::Reset)),
        "q" => Some(ConsoleInput::Quit),
        _ => None,
    }
}

/// Forwards console lines to the simulator until `q`, EOF, or the simulator is gone.
/// Returns true only when the operator asked to quit.
pub async fn run_console<R>(
    reader: R,
    commands: mpsc::Sender<OperatorCommand>,
) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        match parse_console_input(&line) {
            Some(ConsoleInput::Command(command)) => {
                if commands.send(command).await.is_err() {
                    return Ok(false);
                }
            }
            Some(ConsoleInput::Quit) => return Ok(true),
            None => {
                if !line.trim().is_empty() {
                    log::info!(
                        "[sim] unknown command {:?} (m = mode, t = turnout, r = reset, q = quit)",
                        line.trim()
                    );
                }
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::rail::adapters::link::mock::StoreLink;
    use crate::rail::core::automaton::ControlMode;
    use crate::rail::core::store::RegisterStore;

    #[derive(Clone, Default)]
    struct CollectSink(Arc<Mutex<Vec<YardSnapshot>>>);

    impl TelemetrySink for CollectSink {
        fn publish(&mut self, snapshot: &YardSnapshot) {
            self.0.lock().push(snapshot.clone());
        }
    }

    fn fast_config() -> SimulatorConfig {
        SimulatorConfig {
            tick_hz: 200,
            poll_interval_ms: 10,
            blackout_ms: 50,
            publish_hold_ms: 20,
            telemetry_hz: 50,
            telemetry_addr: None,
            ..SimulatorConfig::default()
        }
    }

    #[test]
    fn console_keys_map_to_operator_commands() {
        assert_eq!(
            parse_console_input("M"),
            Some(ConsoleInput::Command(OperatorCommand::ToggleMode))
        );
        assert_eq!(
            parse_console_input("t\n"),
            Some(ConsoleInput::Command(OperatorCommand::ToggleTurnout))
        );
        assert_eq!(
            parse_console_input("r"),
            Some(ConsoleInput::Command(OperatorCommand::Reset))
        );
        assert_eq!(parse_console_input("q"), Some(ConsoleInput::Quit));
        assert_eq!(parse_console_input("x"), None);
    }

    #[tokio::test]
    async fn simulator_publishes_to_the_store_and_emits_telemetry() {
        let store = Arc::new(RegisterStore::with_defaults(200, 300).unwrap());
        let link = StoreLink::new(Arc::clone(&store));
        let sink = CollectSink::default();
        let collected = Arc::clone(&sink.0);

        let handle = spawn_simulator(&fast_config(), Box::new(link.clone()), Box::new(sink));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!link.writes().is_empty());
        // T1 is on its way from A (or already there) with AB proceed
        assert_eq!(store.register(100).unwrap(), 1);
        assert_eq!(store.read_registers(0, 3).unwrap(), vec![1, 0, 0]);

        let snapshots = collected.lock().clone();
        assert!(snapshots.len() >= 3);
        assert_eq!(snapshots[0].comms, "OFF");
        assert!(snapshots.iter().any(|s| s.comms == "ON"));
        assert!(handle.latest().is_some());

        handle.stop().await;
    }

    #[test]
    fn tick_rates_outside_the_usable_range_still_give_a_period() {
        assert_eq!(period(0), Duration::from_secs(1));
        assert_eq!(period(u32::MAX), Duration::from_millis(1));
        assert!(period(u32::MAX) > Duration::ZERO);
        assert_eq!(period(20), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn console_commands_reach_the_automaton() {
        let store = Arc::new(RegisterStore::with_defaults(200, 300).unwrap());
        let link = StoreLink::new(Arc::clone(&store));
        let handle = spawn_simulator(&fast_config(), Box::new(link), Box::new(NullSink));

        let input: &[u8] = b"m\nq\nm\n";
        assert!(run_console(input, handle.commands()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let latest = handle.latest().unwrap();
        assert_eq!(latest.mode, ControlMode::Manual.label());
        handle.stop().await;
    }
}
