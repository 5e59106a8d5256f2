//! Latest-frame slots for the streaming layer.
//!
//! One slot per camera, fixed at construction. `publish` replaces the slot's
//! contents; `latest` hands out a shared reference to whatever is newest. No
//! queue and no backpressure: a slow reader skips frames, a fast one sees
//! repeats.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use crate::CameraId;

/// Encoded bytes for one published frame.
#[derive(Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub published_at: SystemTime,
    /// Per-camera publish counter, starting at 1.
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<Arc<EncodedFrame>>,
    published: u64,
}

#[derive(Debug)]
pub struct SharedFrameBuffer {
    slots: HashMap<CameraId, Mutex<Slot>>,
}

impl SharedFrameBuffer {
    pub fn new(cameras: impl IntoIterator<Item = CameraId>) -> Self {
        Self {
            slots: cameras
                .into_iter()
                .map(|id| (id, Mutex::new(Slot::default())))
                .collect(),
        }
    }

    /// Replace the camera's slot. Returns false for an unknown camera.
    pub fn publish(&self, camera: CameraId, bytes: Vec<u8>) -> bool {
        let Some(slot) = self.slots.get(&camera) else {
            return false;
        };
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.published += 1;
        slot.latest = Some(Arc::new(EncodedFrame {
            bytes,
            published_at: SystemTime::now(),
            sequence: slot.published,
        }));
        true
    }

    /// Newest frame, or `None` if the camera never published (or is unknown).
    pub fn latest(&self, camera: CameraId) -> Option<Arc<EncodedFrame>> {
        let slot = self.slots.get(&camera)?;
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .clone()
    }

    pub fn cameras(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.slots.keys().copied()
    }
}
