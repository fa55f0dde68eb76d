//! 列车实体：离散位置 + 在途运动插值。
//!
//! 列车在运动完成之前保持出发地的位置（占用按出发地计算），完成时才落到目的地。

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TrainId {
    T1,
    T2,
}

impl TrainId {
    pub fn index(self) -> usize {
        match self {
            TrainId::T1 => 0,
            TrainId::T2 => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            TrainId::T1 => TrainId::T2,
            TrainId::T2 => TrainId::T1,
        }
    }

    pub fn origin(self) -> Location {
        match self {
            TrainId::T1 => Location::A,
            TrainId::T2 => Location::Siding,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Location {
    A,
    /// Junction block.
    B,
    C,
    Siding,
    Crash,
}

impl Location {
    pub fn code(self) -> &'static str {
        match self {
            Location::A => "A",
            Location::B => "B",
            Location::C => "C",
            Location::Siding => "S",
            Location::Crash => "CRASH",
        }
    }

    pub fn rest_point(self) -> Point {
        match self {
            Location::A => geometry::BLOCK_A,
            Location::B | Location::Crash => geometry::BLOCK_B,
            Location::C => geometry::BLOCK_C,
            Location::Siding => geometry::SIDING_REST,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn lerp(self, to: Point, t: f64) -> Point {
        Point {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
        }
    }
}

/// Schematic coordinates: main line on y = 0, siding on y = 1, one unit per block.
pub mod geometry {
    use super::Point;

    pub const BLOCK_A: Point = Point::new(0.0, 0.0);
    pub const BLOCK_B: Point = Point::new(1.0, 0.0);
    pub const BLOCK_C: Point = Point::new(2.0, 0.0);
    pub const SIDING_REST: Point = Point::new(-0.2, 1.0);
    /// Where the siding leaves the straight and curves onto the junction.
    pub const SIDING_KNEE: Point = Point::new(0.9, 1.0);
    pub const OUTBOUND_SPLIT: f64 = 0.55;
    pub const INBOUND_SPLIT: f64 = 0.45;
    pub const CRASH_OFFSET: f64 = 0.09;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Route {
    Line { from: Point, to: Point },
    SidingToJunction,
    JunctionToSiding,
}

impl Route {
    pub fn between(from: Location, to: Location) -> Option<Self> {
        use Location::*;
        match (from, to) {
            (A, B) | (B, C) | (C, B) | (B, A) => Some(Route::Line {
                from: from.rest_point(),
                to: to.rest_point(),
            }),
            (Siding, B) => Some(Route::SidingToJunction),
            (B, Siding) => Some(Route::JunctionToSiding),
            _ => None,
        }
    }

    pub fn point_at(&self, t: f64) -> Point {
        use geometry::*;
        let t = t.clamp(0.0, 1.0);
        match self {
            Route::Line { from, to } => from.lerp(*to, t),
            Route::SidingToJunction => {
                if t < OUTBOUND_SPLIT {
                    SIDING_REST.lerp(SIDING_KNEE, t / OUTBOUND_SPLIT)
                } else {
                    SIDING_KNEE.lerp(BLOCK_B, (t - OUTBOUND_SPLIT) / (1.0 - OUTBOUND_SPLIT))
                }
            }
            Route::JunctionToSiding => {
                if t < INBOUND_SPLIT {
                    BLOCK_B.lerp(SIDING_KNEE, t / INBOUND_SPLIT)
                } else {
                    SIDING_KNEE.lerp(SIDING_REST, (t - INBOUND_SPLIT) / (1.0 - INBOUND_SPLIT))
                }
            }
        }
    }

    pub fn heads_right(&self) -> bool {
        match self {
            Route::Line { from, to } => to.x > from.x,
            Route::SidingToJunction => true,
            Route::JunctionToSiding => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Motion {
    pub route: Route,
    pub destination: Location,
    pub started: Instant,
    pub duration: Duration,
}

impl Motion {
    pub fn progress(&self, now: Instant) -> f64 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        (elapsed / self.duration.as_secs_f64()).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Train {
    pub id: TrainId,
    pub location: Location,
    pub position: Point,
    pub facing_right: bool,
    pub motion: Option<Motion>,
}

impl Train {
    pub fn at_origin(id: TrainId) -> Self {
        let location = id.origin();
        Self {
            id,
            location,
            position: location.rest_point(),
            facing_right: true,
            motion: None,
        }
    }

    pub fn is_moving(&self) -> bool {
        self.motion.is_some()
    }

    /// Stationary at `location`.
    pub fn rests_at(&self, location: Location) -> bool {
        !self.is_moving() && self.location == location
    }

    pub fn destination(&self) -> Option<Location> {
        self.motion.map(|m| m.destination)
    }

    /// 从当前位置出发；没有对应线路时返回 false，不改变状态。
    pub fn start(&mut self, to: Location, now: Instant, duration: Duration) -> bool {
        let Some(route) = Route::between(self.location, to) else {
            return false;
        };
        self.facing_right = route.heads_right();
        self.motion = Some(Motion {
            route,
            destination: to,
            started: now,
            duration,
        });
        true
    }

    /// Update the interpolated position; true once the motion reached its end.
    pub fn advance(&mut self, now: Instant) -> bool {
        let Some(motion) = self.motion else {
            return false;
        };
        let t = motion.progress(now);
        self.position = motion.route.point_at(t);
        t >= 1.0
    }

    pub fn resolve(&mut self) {
        if let Some(motion) = self.motion.take() {
            self.location = motion.destination;
            self.position = motion.destination.rest_point();
        }
    }

    pub fn freeze_at_junction(&mut self, offset: f64) {
        self.motion = None;
        self.location = Location::Crash;
        self.position = Point::new(geometry::BLOCK_B.x + offset, geometry::BLOCK_B.y);
    }
}
