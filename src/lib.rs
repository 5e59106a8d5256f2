//! RAIV guard
//!
//! Real-time obstruction monitor for a remotely operated vehicle.
//!
//! # Architecture
//!
//! Every camera runs its own worker thread:
//!
//! ```text
//! FrameSource -> DangerScorer -> PersistenceGate -> StopLatch -> CommandDispatcher
//!      |
//!      +-> SharedFrameBuffer (every frame, any role)
//!      +-> SnapshotSink (Capture cameras, while moving)
//! ```
//!
//! Two more threads run beside the cameras: the command dispatcher (the only
//! place that touches the actuator network) and the vehicle state monitor
//! (the only writer of [`vehicle::VehicleState`]).
//!
//! Cross-worker mutable state is limited to the vehicle state record and the
//! stop latch. Everything else (source handle, gate counter, snapshot
//! throttle) is owned by the camera worker that uses it.
//!
//! # Module Structure
//!
//! - `frame`: owned RGB frames, JPEG encoding, alarm overlay
//! - `ingest`: camera sources (synthetic, HTTP MJPEG, V4L2) and reconnect policy
//! - `detect`: pluggable object-detection backends
//! - `danger`: per-frame obstruction scoring
//! - `gate`: debounce state machine
//! - `latch`: stop authorisation policy
//! - `dispatch`: non-blocking outbound command queue
//! - `buffer`: last-writer-wins frame slots for the streaming layer
//! - `vehicle`: vehicle motion state and telemetry polling
//! - `snapshot`: throttled snapshot persistence
//! - `worker`, `runtime`: thread wiring

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod buffer;
pub mod config;
pub mod danger;
pub mod detect;
pub mod dispatch;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod latch;
pub mod runtime;
pub mod snapshot;
pub mod ticker;
pub mod vehicle;
pub mod worker;

pub use buffer::{EncodedFrame, SharedFrameBuffer};
pub use config::{CameraConfig, GuardConfig};
pub use danger::{DangerReason, DangerScorer, DangerVerdict};
pub use dispatch::{CommandDispatcher, CommandSink, DispatcherHandle, OutboundCommand};
pub use frame::Frame;
pub use gate::{DecayPolicy, GateState, GateTransition, PersistenceGate};
pub use ingest::{CameraSource, FrameSource};
pub use latch::StopLatch;
pub use runtime::{GuardHandle, GuardRuntime};
pub use vehicle::{Direction, MotionStatus, VehicleState, VehicleStateHandle};
pub use worker::{CameraWorker, WorkerStats};

/// Camera identifier as used in config, logs and snapshot names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CAM{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    /// Scored for obstructions; may trigger an emergency stop.
    Detect,
    /// Streamed and snapshotted while moving; never scored.
    Capture,
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraRole::Detect => f.write_str("DETECT"),
            CameraRole::Capture => f.write_str("CAPTURE"),
        }
    }
}

/// Which way a camera physically looks along the vehicle's axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Rear,
}

impl Facing {
    /// The travel direction this camera guards.
    pub fn guards(self) -> Direction {
        match self {
            Facing::Front => Direction::Forward,
            Facing::Rear => Direction::Backward,
        }
    }
}

pub(crate) fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_ms() -> u64 {
    unix_millis(SystemTime::now())
}
