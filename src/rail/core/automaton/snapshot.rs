//! 遥测快照：字段名与旧 HMI 保持一致（`turnout_main`、`occ.S`、`trains.T1.dir_right` ...）。

use std::time::Instant;

use serde::Serialize;

use super::train::Train;
use super::{Automaton, TrainId};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignalView {
    pub ab: u8,
    pub bc: u8,
    pub sb: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OccupancyView {
    #[serde(rename = "A")]
    pub a: u8,
    #[serde(rename = "B")]
    pub b: u8,
    #[serde(rename = "C")]
    pub c: u8,
    #[serde(rename = "S")]
    pub s: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrainView {
    pub x: f64,
    pub y: f64,
    pub dir_right: bool,
    pub loc: &'static str,
}

impl From<&Train> for TrainView {
    fn from(train: &Train) -> Self {
        Self {
            x: train.position.x,
            y: train.position.y,
            dir_right: train.facing_right,
            loc: train.location.code(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrainsView {
    #[serde(rename = "T1")]
    pub t1: TrainView,
    #[serde(rename = "T2")]
    pub t2: TrainView,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct YardSnapshot {
    /// Unix time in seconds.
    pub t: f64,
    pub mode: &'static str,
    pub comms: &'static str,
    pub estop: u8,
    pub turnout_main: u8,
    pub signals: SignalView,
    pub occ: OccupancyView,
    pub trains: TrainsView,
    pub crash: u8,
}

impl Automaton {
    pub fn snapshot(&self, now: Instant, unix_time: f64) -> YardSnapshot {
        let signals = self.signals.to_registers();
        YardSnapshot {
            t: unix_time,
            mode: self.effective_mode().label(),
            comms: if self.comms_enabled(now) { "ON" } else { "OFF" },
            estop: u8::from(self.estop),
            turnout_main: u8::from(self.turnout.to_coil()),
            signals: SignalView {
                ab: signals[0] as u8,
                bc: signals[1] as u8,
                sb: signals[2] as u8,
            },
            occ: OccupancyView {
                a: u8::from(self.occupancy.a),
                b: u8::from(self.occupancy.b),
                c: u8::from(self.occupancy.c),
                s: u8::from(self.occupancy.siding),
            },
            trains: TrainsView {
                t1: TrainView::from(self.train(TrainId::T1)),
                t2: TrainView::from(self.train(TrainId::T2)),
            },
            crash: u8::from(self.collision.is_some()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rail::core::automaton::AutomatonTiming;

    #[test]
    fn snapshot_json_keeps_hmi_field_names() {
        let t0 = Instant::now();
        let automaton = Automaton::new(AutomatonTiming::default(), t0);
        let snapshot = automaton.snapshot(t0, 1_700_000_000.25);

        assert_eq!(snapshot.comms, "OFF");
        assert_eq!(
            automaton.snapshot(t0 + Duration::from_secs(3), 0.0).comms,
            "ON"
        );

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["t"], 1_700_000_000.25);
        assert_eq!(value["mode"], "AUTO");
        assert_eq!(value["turnout_main"], 1);
        assert_eq!(value["signals"]["sb"], 0);
        assert_eq!(value["occ"]["A"], 1);
        assert_eq!(value["occ"]["S"], 1);
        assert_eq!(value["trains"]["T1"]["loc"], "A");
        assert_eq!(value["trains"]["T2"]["loc"], "S");
        assert_eq!(value["trains"]["T2"]["x"], -0.2);
        assert_eq!(value["trains"]["T1"]["dir_right"], true);
        assert_eq!(value["crash"], 0);
    }
}
