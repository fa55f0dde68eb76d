//! 自动编排（autonomous）与手动步进（manual）。
//!
//! 自动模式下两列车按固定剧本循环：T1 A->B->C，T2 侧线->B，在 B 等一个黑窗，
//! T2 回侧线，T1 C->B->A，在起点再等一个黑窗。每一步只在列车静止时推进。

use std::time::Instant;

use serde::Serialize;

use super::train::{Location, TrainId};
use super::Automaton;
use crate::rail::core::model::{Aspect, Signals, Turnout};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SequencePhase {
    InitialWait,
    T1Outbound,
    T2Outbound,
    WaitAtJunction,
    T2Return,
    T1Return,
    WaitAtOrigin,
}

const AB_ONLY: Signals = Signals {
    ab: Aspect::Proceed,
    bc: Aspect::Stop,
    sb: Aspect::Stop,
};

const BC_ONLY: Signals = Signals {
    ab: Aspect::Stop,
    bc: Aspect::Proceed,
    sb: Aspect::Stop,
};

const SB_ONLY: Signals = Signals {
    ab: Aspect::Stop,
    bc: Aspect::Stop,
    sb: Aspect::Proceed,
};

impl Automaton {
    fn rests_at(&self, id: TrainId, location: Location) -> bool {
        self.trains[id.index()].rests_at(location)
    }

    fn start_move(&mut self, id: TrainId, to: Location, now: Instant) {
        let duration = self.timing.move_duration;
        let train = &mut self.trains[id.index()];
        if !train.start(to, now, duration) {
            log::debug!("[sim] no route for {:?} from {:?} to {:?}", id, train.location, to);
        }
    }

    fn headway_clear(&self, now: Instant) -> bool {
        self.headway_until.map_or(true, |until| now >= until)
    }

    fn enter_wait(&mut self, phase: SequencePhase, now: Instant) {
        self.signals = Signals::ALL_STOP;
        self.phase = phase;
        self.blackout_until = now + self.timing.blackout;
    }

    pub(super) fn step_sequence(&mut self, now: Instant) {
        match self.phase {
            SequencePhase::InitialWait => {
                if now >= self.blackout_until {
                    self.signals = Signals::ALL_STOP;
                    self.phase = SequencePhase::T1Outbound;
                }
            }
            SequencePhase::T1Outbound => {
                if self.rests_at(TrainId::T1, Location::A) {
                    self.signals = AB_ONLY;
                    self.headway_until = Some(now + self.timing.headway);
                    self.start_move(TrainId::T1, Location::B, now);
                } else if self.rests_at(TrainId::T1, Location::B) {
                    self.signals = BC_ONLY;
                    self.start_move(TrainId::T1, Location::C, now);
                } else if self.rests_at(TrainId::T1, Location::C) {
                    self.signals = Signals::ALL_STOP;
                    self.phase = SequencePhase::T2Outbound;
                }
            }
            SequencePhase::T2Outbound => {
                if self.rests_at(TrainId::T2, Location::Siding)
                    && self.turnout == Turnout::Main
                    && self.headway_clear(now)
                {
                    self.signals = SB_ONLY;
                    self.start_move(TrainId::T2, Location::B, now);
                } else if self.rests_at(TrainId::T2, Location::B) {
                    self.enter_wait(SequencePhase::WaitAtJunction, now);
                }
            }
            SequencePhase::WaitAtJunction => {
                if now >= self.blackout_until {
                    self.phase = SequencePhase::T2Return;
                }
            }
            SequencePhase::T2Return => {
                if self.rests_at(TrainId::T2, Location::B) && self.turnout == Turnout::Main {
                    self.signals = SB_ONLY;
                    self.start_move(TrainId::T2, Location::Siding, now);
                } else if self.rests_at(TrainId::T2, Location::Siding) {
                    self.signals = Signals::ALL_STOP;
                    self.phase = SequencePhase::T1Return;
                }
            }
            SequencePhase::T1Return => {
                if self.rests_at(TrainId::T1, Location::C) {
                    self.signals = BC_ONLY;
                    self.start_move(TrainId::T1, Location::B, now);
                } else if self.rests_at(TrainId::T1, Location::B) {
                    self.signals = AB_ONLY;
                    self.start_move(TrainId::T1, Location::A, now);
                } else if self.rests_at(TrainId::T1, Location::A) {
                    self.enter_wait(SequencePhase::WaitAtOrigin, now);
                }
            }
            SequencePhase::WaitAtOrigin => {
                if now >= self.blackout_until {
                    self.phase = SequencePhase::T1Outbound;
                }
            }
        }
    }

    /// Trains follow whatever the signals say; first matching rule wins.
    pub(super) fn step_manual(&mut self, now: Instant) {
        let signals = self.signals;

        let t1 = &self.trains[TrainId::T1.index()];
        if !t1.is_moving() {
            let target = match t1.location {
                Location::A if signals.ab.is_proceed() => Some(Location::B),
                Location::B if signals.bc.is_proceed() => Some(Location::C),
                Location::C if signals.bc.is_proceed() => Some(Location::B),
                Location::B if signals.ab.is_proceed() => Some(Location::A),
                _ => None,
            };
            if let Some(to) = target {
                self.start_move(TrainId::T1, to, now);
            }
        }

        if self.turnout != Turnout::Main || !signals.sb.is_proceed() {
            return;
        }
        let t2 = &self.trains[TrainId::T2.index()];
        if t2.is_moving() {
            return;
        }
        let target = match t2.location {
            Location::Siding => Some(Location::B),
            Location::B => Some(Location::Siding),
            _ => None,
        };
        if let Some(to) = target {
            self.start_move(TrainId::T2, to, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rail::core::automaton::AutomatonTiming;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    /// Drives sequencing and motion only, without any link I/O.
    fn drive(automaton: &mut Automaton, t0: Instant, from: u64, until: u64) -> bool {
        let mut offset = from;
        while offset <= until {
            let now = t0 + ms(offset);
            automaton.step_sequence(now);
            if automaton.advance_trains(now) {
                return true;
            }
            offset += 10;
        }
        false
    }

    #[test]
    fn full_autonomous_cycle_returns_both_trains_home() {
        let t0 = Instant::now();
        let mut automaton = Automaton::new(AutomatonTiming::default(), t0);

        assert!(!drive(&mut automaton, t0, 0, 10_000));
        assert_eq!(automaton.phase, SequencePhase::WaitAtJunction);

        assert!(!drive(&mut automaton, t0, 10_010, 18_000));
        assert_eq!(automaton.phase, SequencePhase::WaitAtOrigin);
        assert!(automaton.rests_at(TrainId::T1, Location::A));
        assert!(automaton.rests_at(TrainId::T2, Location::Siding));
        assert_eq!(automaton.signals, Signals::ALL_STOP);
    }

    #[test]
    fn siding_train_waits_for_headway_and_main_turnout() {
        let t0 = Instant::now();
        let mut automaton = Automaton::new(AutomatonTiming::default(), t0);
        automaton.phase = SequencePhase::T2Outbound;
        automaton.headway_until = Some(t0 + ms(1200));

        automaton.step_sequence(t0 + ms(500));
        assert!(!automaton.trains[TrainId::T2.index()].is_moving());

        automaton.turnout = Turnout::Siding;
        automaton.step_sequence(t0 + ms(1300));
        assert!(!automaton.trains[TrainId::T2.index()].is_moving());

        automaton.turnout = Turnout::Main;
        automaton.step_sequence(t0 + ms(1300));
        assert_eq!(
            automaton.trains[TrainId::T2.index()].destination(),
            Some(Location::B)
        );
        assert_eq!(automaton.signals, SB_ONLY);
    }

    #[test]
    fn manual_stepping_prefers_forward_move_at_junction() {
        let t0 = Instant::now();
        let mut automaton = Automaton::new(AutomatonTiming::default(), t0);
        automaton.trains[TrainId::T1.index()].location = Location::B;
        automaton.signals = Signals::new(Aspect::Proceed, Aspect::Proceed, Aspect::Stop);

        automaton.step_manual(t0);
        assert_eq!(
            automaton.trains[TrainId::T1.index()].destination(),
            Some(Location::C)
        );
        assert!(!automaton.trains[TrainId::T2.index()].is_moving());
    }

    #[test]
    fn manual_siding_move_requires_main_turnout() {
        let t0 = Instant::now();
        let mut automaton = Automaton::new(AutomatonTiming::default(), t0);
        automaton.signals = SB_ONLY;
        automaton.turnout = Turnout::Siding;

        automaton.step_manual(t0);
        assert!(!automaton.trains[TrainId::T2.index()].is_moving());

        automaton.turnout = Turnout::Main;
        automaton.step_manual(t0);
        assert_eq!(
            automaton.trains[TrainId::T2.index()].destination(),
            Some(Location::B)
        );
    }

    #[test]
    fn manual_signals_can_drive_trains_into_each_other() {
        let t0 = Instant::now();
        let mut automaton = Automaton::new(AutomatonTiming::default(), t0);
        automaton.signals = Signals::new(Aspect::Proceed, Aspect::Stop, Aspect::Proceed);

        automaton.step_manual(t0);
        assert!(automaton.advance_trains(t0 + ms(1600)));
        assert!(automaton.collision.is_some());
        assert_eq!(automaton.trains[0].location, Location::Crash);
        assert_eq!(automaton.trains[1].location, Location::Crash);
    }
}
