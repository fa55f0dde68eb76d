//! 模式仲裁状态机（Mode-Arbitration Automaton）：物理仿真侧的本地控制逻辑。
//!
//! 每个 tick（约 60 Hz）按固定顺序执行：
//! 1. 计算通信使能（碰撞期间恒为开；否则黑窗结束才开），关 -> 开 的边沿安排一次重同步
//! 2. 碰撞未上报：绕过黑窗写碰撞寄存器，成功后锁存，失败下个 tick 重试
//! 3. 通信开且轮询到期（10 Hz）：重同步 / 读控制量 / 发布占用与信号
//! 4. 执行排队的操作员命令
//! 5. 碰撞持续超过阈值：尽力写回碰撞 = 0，然后整体复位
//! 6. 无碰撞且未急停：自动编排或手动步进，再推进列车运动并检测碰撞
//!
//! 远端读写只经过 `PlcLink`；链路失败不会中断 tick，只记日志并在下次机会重连。
//! 时间由调用方传入（`now`），便于在测试里用虚拟时钟推进。

mod sequencer;
mod snapshot;
pub mod train;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::link::{LinkError, PlcLink};
use super::model::{address, bit, Occupancy, Signals, SimulatorConfig, Turnout};

pub use sequencer::SequencePhase;
pub use snapshot::{OccupancyView, SignalView, TrainView, TrainsView, YardSnapshot};
pub use train::{Location, Train, TrainId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AutomatonTiming {
    pub poll_interval: Duration,
    pub blackout: Duration,
    pub publish_hold: Duration,
    pub headway: Duration,
    pub move_duration: Duration,
    pub crash_duration: Duration,
}

impl Default for AutomatonTiming {
    fn default() -> Self {
        Self::from_config(&SimulatorConfig::default())
    }
}

/// 上限一天：`Instant + Duration` 在超大配置值下会溢出 panic。
const MAX_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

fn window(ms: u64) -> Duration {
    Duration::from_millis(ms.min(MAX_WINDOW_MS))
}

impl AutomatonTiming {
    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            poll_interval: window(config.poll_interval_ms),
            blackout: window(config.blackout_ms),
            publish_hold: window(config.publish_hold_ms),
            headway: window(config.headway_ms),
            move_duration: window(config.move_duration_ms),
            crash_duration: window(config.crash_duration_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ControlMode {
    Autonomous,
    Manual,
}

impl ControlMode {
    pub fn label(self) -> &'static str {
        match self {
            ControlMode::Autonomous => "AUTO",
            ControlMode::Manual => "MANUAL",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    ToggleMode,
    ToggleTurnout,
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Collision {
    started: Instant,
    crash_reported: bool,
}

/// What one tick did; used for logging and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub comms_enabled: bool,
    pub polled: bool,
    pub resynced: bool,
    pub published: bool,
    /// `Some(v)` when the crash register was successfully written with `v`.
    pub crash_written: Option<bool>,
    pub collision_started: bool,
    pub reset: bool,
}

/// Control fields read on every poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ControlView {
    turnout: Turnout,
    estop: bool,
    supervised: bool,
}

pub struct Automaton {
    timing: AutomatonTiming,
    local_mode: ControlMode,
    supervised_requested: bool,
    comms_were_enabled: bool,
    need_resync: bool,
    publish_hold_until: Option<Instant>,
    blackout_until: Instant,
    last_poll: Option<Instant>,
    signals: Signals,
    turnout: Turnout,
    estop: bool,
    occupancy: Occupancy,
    collision: Option<Collision>,
    headway_until: Option<Instant>,
    phase: SequencePhase,
    trains: [Train; 2],
    pending: VecDeque<OperatorCommand>,
}

impl Automaton {
    pub fn new(timing: AutomatonTiming, now: Instant) -> Self {
        let mut automaton = Self {
            timing,
            local_mode: ControlMode::Autonomous,
            supervised_requested: false,
            comms_were_enabled: true,
            need_resync: true,
            publish_hold_until: None,
            blackout_until: now,
            last_poll: None,
            signals: Signals::ALL_STOP,
            turnout: Turnout::Main,
            estop: false,
            occupancy: Occupancy::default(),
            collision: None,
            headway_until: None,
            phase: SequencePhase::InitialWait,
            trains: [Train::at_origin(TrainId::T1), Train::at_origin(TrainId::T2)],
            pending: VecDeque::new(),
        };
        automaton.reset(now);
        automaton
    }

    pub fn command(&mut self, command: OperatorCommand) {
        self.pending.push_back(command);
    }

    /// Manual when the operator asked for it locally or the PLC is supervised,
    /// never while a collision is being shown.
    pub fn effective_mode(&self) -> ControlMode {
        if self.collision.is_some() {
            return ControlMode::Autonomous;
        }
        if self.local_mode == ControlMode::Manual || self.supervised_requested {
            ControlMode::Manual
        } else {
            ControlMode::Autonomous
        }
    }

    pub fn comms_enabled(&self, now: Instant) -> bool {
        self.collision.is_some() || now >= self.blackout_until
    }

    pub fn local_mode(&self) -> ControlMode {
        self.local_mode
    }

    pub fn supervised_requested(&self) -> bool {
        self.supervised_requested
    }

    pub fn collision_active(&self) -> bool {
        self.collision.is_some()
    }

    pub fn needs_resync(&self) -> bool {
        self.need_resync
    }

    pub fn signals(&self) -> Signals {
        self.signals
    }

    pub fn turnout(&self) -> Turnout {
        self.turnout
    }

    pub fn estop(&self) -> bool {
        self.estop
    }

    pub fn occupancy(&self) -> Occupancy {
        self.occupancy
    }

    pub fn phase(&self) -> SequencePhase {
        self.phase
    }

    pub fn blackout_until(&self) -> Instant {
        self.blackout_until
    }

    pub fn train(&self, id: TrainId) -> &Train {
        &self.trains[id.index()]
    }

    pub async fn advance(&mut self, now: Instant, link: &mut dyn PlcLink) -> TickReport {
        let mut report = TickReport::default();

        let comms_enabled = self.comms_enabled(now);
        if comms_enabled && !self.comms_were_enabled {
            self.need_resync = true;
        }
        self.comms_were_enabled = comms_enabled;
        report.comms_enabled = comms_enabled;

        self.report_crash(link, &mut report).await;

        if comms_enabled && self.poll_due(now) {
            self.last_poll = Some(now);
            report.polled = true;
            self.poll(now, link, &mut report).await;
        }

        while let Some(command) = self.pending.pop_front() {
            self.apply_command(command, now, comms_enabled, link, &mut report)
                .await;
        }

        if let Some(collision) = self.collision {
            if now.saturating_duration_since(collision.started) >= self.timing.crash_duration {
                if ensure_connected(link).await {
                    match link.write_registers(address::HR_IN_CRASH, &[0]).await {
                        Ok(()) => report.crash_written = Some(false),
                        Err(err) => log::debug!("[sim][link] crash clear failed: {err}"),
                    }
                }
                log::info!("[sim] collision cleared, resetting yard");
                self.reset(now);
                report.reset = true;
            }
        }

        if self.collision.is_none() && !self.estop {
            match self.effective_mode() {
                ControlMode::Autonomous => self.step_sequence(now),
                ControlMode::Manual => self.step_manual(now),
            }
            if self.advance_trains(now) {
                report.collision_started = true;
                self.report_crash(link, &mut report).await;
            }
        }

        report
    }

    fn poll_due(&self, now: Instant) -> bool {
        self.last_poll
            .map_or(true, |last| now.saturating_duration_since(last) >= self.timing.poll_interval)
    }

    async fn poll(&mut self, now: Instant, link: &mut dyn PlcLink, report: &mut TickReport) {
        if !ensure_connected(link).await {
            return;
        }

        if self.need_resync && self.collision.is_none() {
            let pulled = match read_control(link).await {
                Ok(control) => read_supervised_view(link)
                    .await
                    .map(|(signals, overrides)| (control, signals, overrides)),
                Err(err) => Err(err),
            };
            match pulled {
                Ok((control, signals, overrides)) => {
                    self.apply_control(control);
                    self.signals = signals;
                    self.occupancy = overrides;
                    self.publish_hold_until = Some(now + self.timing.publish_hold);
                    self.need_resync = false;
                    report.resynced = true;
                    log::info!("[sim] resynchronized from plc");
                }
                Err(err) => {
                    log::warn!("[sim][link] resync failed, retrying next poll: {err}");
                    return;
                }
            }
        }

        match read_control(link).await {
            Ok(control) => self.apply_control(control),
            Err(err) => {
                log::debug!("[sim][link] poll failed: {err}");
                return;
            }
        }

        if self.collision.is_some() {
            return;
        }

        if self.effective_mode() == ControlMode::Manual {
            match read_supervised_view(link).await {
                Ok((signals, overrides)) => {
                    self.signals = signals;
                    self.occupancy = overrides;
                }
                Err(err) => log::debug!("[sim][link] supervised read failed: {err}"),
            }
            return;
        }

        if self.publish_hold_until.is_some_and(|until| now < until) {
            return;
        }

        self.occupancy = self.occupancy_from_trains();
        let inputs = self.occupancy.to_input_registers(false);
        if let Err(err) = link.write_registers(address::HR_IN_OCC_A, &inputs).await {
            log::debug!("[sim][link] occupancy publish failed: {err}");
            return;
        }
        let signals = self.signals.to_registers();
        if let Err(err) = link.write_registers(address::HR_SIG_AB, &signals).await {
            log::debug!("[sim][link] signal publish failed: {err}");
            return;
        }
        report.published = true;
    }

    fn apply_control(&mut self, control: ControlView) {
        self.turnout = control.turnout;
        self.estop = control.estop;
        self.supervised_requested = control.supervised;
    }

    async fn apply_command(
        &mut self,
        command: OperatorCommand,
        now: Instant,
        comms_enabled: bool,
        link: &mut dyn PlcLink,
        report: &mut TickReport,
    ) {
        match command {
            OperatorCommand::ToggleMode => {
                if self.collision.is_some() {
                    return;
                }
                self.local_mode = match self.local_mode {
                    ControlMode::Autonomous => ControlMode::Manual,
                    ControlMode::Manual => ControlMode::Autonomous,
                };
                if self.local_mode == ControlMode::Autonomous {
                    self.need_resync = true;
                }
                log::info!("[sim] local mode -> {}", self.local_mode.label());
            }
            OperatorCommand::ToggleTurnout => {
                if !comms_enabled || self.collision.is_some() {
                    log::debug!("[sim] turnout toggle ignored while comms are off");
                    return;
                }
                if !ensure_connected(link).await {
                    return;
                }
                match flip_turnout(link).await {
                    Ok(main) => log::info!("[sim] turnout main -> {}", u8::from(main)),
                    Err(err) => log::warn!("[sim][link] turnout toggle failed: {err}"),
                }
            }
            OperatorCommand::Reset => {
                log::info!("[sim] operator reset");
                self.reset(now);
                report.reset = true;
            }
        }
    }

    async fn report_crash(&mut self, link: &mut dyn PlcLink, report: &mut TickReport) {
        let Some(collision) = self.collision else {
            return;
        };
        if collision.crash_reported || !ensure_connected(link).await {
            return;
        }
        match link.write_registers(address::HR_IN_CRASH, &[1]).await {
            Ok(()) => {
                self.collision = Some(Collision {
                    crash_reported: true,
                    ..collision
                });
                report.crash_written = Some(true);
            }
            Err(err) => log::debug!("[sim][link] crash write failed, retrying: {err}"),
        }
    }

    /// Back to the initial layout with a fresh blackout window.
    fn reset(&mut self, now: Instant) {
        self.trains = [Train::at_origin(TrainId::T1), Train::at_origin(TrainId::T2)];
        self.signals = Signals::ALL_STOP;
        self.local_mode = ControlMode::Autonomous;
        self.supervised_requested = false;
        self.collision = None;
        self.headway_until = None;
        self.phase = SequencePhase::InitialWait;
        self.blackout_until = now + self.timing.blackout;
        self.need_resync = true;
        self.publish_hold_until = None;
        self.occupancy = self.occupancy_from_trains();
    }

    fn occupancy_from_trains(&self) -> Occupancy {
        let mut occupancy = Occupancy::default();
        for train in &self.trains {
            match train.location {
                Location::A => occupancy.a = true,
                Location::B => occupancy.b = true,
                Location::C => occupancy.c = true,
                Location::Siding => occupancy.siding = true,
                Location::Crash => {}
            }
        }
        occupancy
    }

    /// Returns true when a collision started during this call.
    fn advance_trains(&mut self, now: Instant) -> bool {
        let mut arrived = [false; 2];
        for (i, train) in self.trains.iter_mut().enumerate() {
            arrived[i] = train.advance(now);
        }

        for id in [TrainId::T1, TrainId::T2] {
            if !arrived[id.index()] {
                continue;
            }
            let destination = self.trains[id.index()].destination();
            let other = &self.trains[id.other().index()];
            let junction_taken = other.location == Location::B
                || other.destination() == Some(Location::B);
            if destination == Some(Location::B) && junction_taken {
                self.start_collision(now);
                return true;
            }
            self.trains[id.index()].resolve();
        }
        false
    }

    fn start_collision(&mut self, now: Instant) {
        log::warn!("[sim] collision at junction B");
        self.collision = Some(Collision {
            started: now,
            crash_reported: false,
        });
        self.local_mode = ControlMode::Autonomous;
        self.supervised_requested = false;
        self.signals = Signals::ALL_STOP;
        self.trains[TrainId::T1.index()].freeze_at_junction(-train::geometry::CRASH_OFFSET);
        self.trains[TrainId::T2.index()].freeze_at_junction(train::geometry::CRASH_OFFSET);
    }
}

async fn ensure_connected(link: &mut dyn PlcLink) -> bool {
    if link.is_connected() {
        return true;
    }
    match link.connect().await {
        Ok(()) => {
            log::info!("[sim][link] connected");
            true
        }
        Err(err) => {
            log::debug!("[sim][link] connect failed: {err}");
            false
        }
    }
}

fn short_read(what: &str) -> LinkError {
    LinkError::Comm {
        message: format!("short read: {what}"),
    }
}

async fn read_control(link: &mut dyn PlcLink) -> Result<ControlView, LinkError> {
    let coils = link.read_coils(address::CO_TURNOUT_MAIN, 2).await?;
    let &[turnout_main, estop, ..] = coils.as_slice() else {
        return Err(short_read("coils 0..1"));
    };
    let mode = link.read_holding_registers(address::HR_MODE, 1).await?;
    let mode = mode.first().copied().ok_or_else(|| short_read("mode"))?;
    Ok(ControlView {
        turnout: Turnout::from_coil(turnout_main),
        estop,
        supervised: bit(mode) == 1,
    })
}

async fn read_supervised_view(link: &mut dyn PlcLink) -> Result<(Signals, Occupancy), LinkError> {
    let signals = link.read_holding_registers(address::HR_SIG_AB, 3).await?;
    let signals = Signals::from_registers(&signals).ok_or_else(|| short_read("signals"))?;
    let overrides = link
        .read_holding_registers(address::HR_OVR_OCC_BASE, 4)
        .await?;
    let overrides =
        Occupancy::from_registers(&overrides).ok_or_else(|| short_read("occupancy overrides"))?;
    Ok((signals, overrides))
}

/// Writes the inverse of the current turnout coil; returns the new value.
async fn flip_turnout(link: &mut dyn PlcLink) -> Result<bool, LinkError> {
    let coils = link.read_coils(address::CO_TURNOUT_MAIN, 1).await?;
    let current = coils.first().copied().ok_or_else(|| short_read("turnout"))?;
    link.write_coil(address::CO_TURNOUT_MAIN, !current).await?;
    Ok(!current)
}
