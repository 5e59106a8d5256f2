//! Vehicle motion state.
//!
//! [`VehicleStateHandle`] is the only cross-worker view of the vehicle. It has
//! exactly one writer (the [`VehicleStateMonitor`]) and many readers (camera
//! workers), and readers tolerate a state up to one poll interval stale.
//!
//! Every Standby -> Moving edge starts a new movement segment and bumps
//! [`VehicleState::segment`]. The stop latch keys its one-shot slots on that
//! number, so rearming happens atomically with the state update.

mod monitor;

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

pub use monitor::{parse_telemetry, HttpTelemetrySource, TelemetrySource, VehicleStateMonitor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionStatus {
    Standby,
    Moving,
}

impl FromStr for MotionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STANDBY" => Ok(Self::Standby),
            "MOVING" => Ok(Self::Moving),
            other => Err(anyhow!("unrecognised vehicle status '{}'", other)),
        }
    }
}

impl fmt::Display for MotionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionStatus::Standby => f.write_str("STANDBY"),
            MotionStatus::Moving => f.write_str("MOVING"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Unknown,
    Forward,
    Backward,
}

impl Direction {
    /// Lenient parse: anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "FORWARD" => Self::Forward,
            "BACKWARD" => Self::Backward,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Unknown => f.write_str("UNKNOWN"),
            Direction::Forward => f.write_str("FORWARD"),
            Direction::Backward => f.write_str("BACKWARD"),
        }
    }
}

/// One successful telemetry poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TelemetryReading {
    pub status: MotionStatus,
    pub direction: Direction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VehicleState {
    pub status: MotionStatus,
    pub direction: Direction,
    /// Time of the last successful poll; `None` until the first one.
    pub last_updated: Option<SystemTime>,
    /// Number of Standby -> Moving edges observed so far.
    pub segment: u64,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            status: MotionStatus::Standby,
            direction: Direction::Unknown,
            last_updated: None,
            segment: 0,
        }
    }
}

impl VehicleState {
    pub fn is_moving(&self) -> bool {
        self.status == MotionStatus::Moving
    }

    fn apply(&mut self, reading: TelemetryReading, at: SystemTime) {
        if self.status == MotionStatus::Standby && reading.status == MotionStatus::Moving {
            self.segment += 1;
        }
        self.status = reading.status;
        self.direction = reading.direction;
        self.last_updated = Some(at);
    }
}

/// Shared, lock-protected vehicle state.
#[derive(Clone, Debug, Default)]
pub struct VehicleStateHandle {
    inner: Arc<RwLock<VehicleState>>,
}

impl VehicleStateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of the current state.
    pub fn snapshot(&self) -> VehicleState {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a reading and return the resulting state.
    pub fn apply(&self, reading: TelemetryReading) -> VehicleState {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.apply(reading, SystemTime::now());
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(status: MotionStatus, direction: Direction) -> TelemetryReading {
        TelemetryReading { status, direction }
    }

    #[test]
    fn segment_advances_only_on_standby_to_moving() {
        let handle = VehicleStateHandle::new();
        assert_eq!(handle.snapshot().segment, 0);
        assert!(handle.snapshot().last_updated.is_none());

        let state = handle.apply(reading(MotionStatus::Moving, Direction::Forward));
        assert_eq!(state.segment, 1);
        assert!(state.last_updated.is_some());

        let state = handle.apply(reading(MotionStatus::Moving, Direction::Backward));
        assert_eq!(state.segment, 1);
        assert_eq!(state.direction, Direction::Backward);

        handle.apply(reading(MotionStatus::Standby, Direction::Unknown));
        handle.apply(reading(MotionStatus::Standby, Direction::Unknown));
        let state = handle.apply(reading(MotionStatus::Moving, Direction::Forward));
        assert_eq!(state.segment, 2);
    }

    #[test]
    fn clones_share_state() {
        let writer = VehicleStateHandle::new();
        let reader = writer.clone();
        writer.apply(reading(MotionStatus::Moving, Direction::Forward));
        assert!(reader.snapshot().is_moving());
    }

    #[test]
    fn parsing_is_case_insensitive() {
        assert_eq!("moving".parse::<MotionStatus>().unwrap(), MotionStatus::Moving);
        assert_eq!(" Standby ".parse::<MotionStatus>().unwrap(), MotionStatus::Standby);
        assert!("PARKED".parse::<MotionStatus>().is_err());
        assert_eq!(Direction::parse("backward"), Direction::Backward);
        assert_eq!(Direction::parse("LEFT"), Direction::Unknown);
    }
}
