//! Stop authorisation.
//!
//! Policy: direction-aware and segment-latched. This is the only policy in
//! the crate.
//!
//! - Only a confirmed camera can request a stop, and only while the vehicle
//!   is moving.
//! - A camera may stop the vehicle only when it faces the direction of
//!   travel (front camera going forward, rear camera reversing). With an
//!   unknown direction every facing is allowed.
//! - There is one latch per travel direction. Each fires at most once per
//!   movement segment and rearms when the vehicle next goes Standby ->
//!   Moving, which is observed as a new [`VehicleState::segment`] number.
//!
//! Rearming is not an action anyone has to remember to take: a slot is armed
//! exactly when it has not fired in the current segment.

use std::sync::{Mutex, PoisonError};

use crate::vehicle::{Direction, VehicleState};
use crate::Facing;

#[derive(Debug, Default)]
pub struct StopLatch {
    /// Segment in which each direction last fired: `[front, rear]`.
    fired: Mutex<[Option<u64>; 2]>,
}

fn slot(facing: Facing) -> usize {
    match facing {
        Facing::Front => 0,
        Facing::Rear => 1,
    }
}

impl StopLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether this camera's state should produce a stop, and if so
    /// disarm its slot for the rest of the segment. Test and set happen
    /// under one lock, so two workers cannot both win the same slot.
    pub fn should_stop(&self, facing: Facing, confirmed: bool, vehicle: &VehicleState) -> bool {
        if !confirmed || !vehicle.is_moving() {
            return false;
        }
        if vehicle.direction != Direction::Unknown && vehicle.direction != facing.guards() {
            return false;
        }
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = &mut fired[slot(facing)];
        if *entry == Some(vehicle.segment) {
            return false;
        }
        *entry = Some(vehicle.segment);
        true
    }

    /// Undo a stop that could not be enqueued, so a later frame in the same
    /// segment can try again.
    pub fn release(&self, facing: Facing, segment: u64) {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = &mut fired[slot(facing)];
        if *entry == Some(segment) {
            *entry = None;
        }
    }

    pub fn is_armed(&self, facing: Facing, segment: u64) -> bool {
        let fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        fired[slot(facing)] != Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::MotionStatus;

    fn moving(direction: Direction, segment: u64) -> VehicleState {
        VehicleState {
            status: MotionStatus::Moving,
            direction,
            last_updated: None,
            segment,
        }
    }

    #[test]
    fn nothing_fires_while_standby_or_unconfirmed() {
        let latch = StopLatch::new();
        let standby = VehicleState {
            segment: 1,
            ..VehicleState::default()
        };
        assert!(!latch.should_stop(Facing::Front, true, &standby));
        assert!(!latch.should_stop(Facing::Front, false, &moving(Direction::Forward, 1)));
        assert!(latch.is_armed(Facing::Front, 1));
    }

    #[test]
    fn fires_once_per_segment_and_rearms_on_new_segment() {
        let latch = StopLatch::new();
        let state = moving(Direction::Forward, 1);
        assert!(latch.should_stop(Facing::Front, true, &state));
        for _ in 0..5 {
            assert!(!latch.should_stop(Facing::Front, true, &state));
        }
        assert!(!latch.is_armed(Facing::Front, 1));
        assert!(latch.should_stop(Facing::Front, true, &moving(Direction::Forward, 2)));
    }

    #[test]
    fn facing_must_match_direction() {
        let latch = StopLatch::new();
        assert!(!latch.should_stop(Facing::Rear, true, &moving(Direction::Forward, 1)));
        assert!(!latch.should_stop(Facing::Front, true, &moving(Direction::Backward, 1)));
        assert!(latch.should_stop(Facing::Rear, true, &moving(Direction::Backward, 1)));
    }

    #[test]
    fn directions_latch_independently() {
        let latch = StopLatch::new();
        assert!(latch.should_stop(Facing::Front, true, &moving(Direction::Forward, 1)));
        // Reversing within the same segment still lets the rear camera stop.
        assert!(latch.should_stop(Facing::Rear, true, &moving(Direction::Backward, 1)));
        assert!(!latch.should_stop(Facing::Rear, true, &moving(Direction::Backward, 1)));
    }

    #[test]
    fn unknown_direction_allows_every_facing_once() {
        let latch = StopLatch::new();
        let state = moving(Direction::Unknown, 4);
        assert!(latch.should_stop(Facing::Front, true, &state));
        assert!(latch.should_stop(Facing::Rear, true, &state));
        assert!(!latch.should_stop(Facing::Front, true, &state));
        assert!(!latch.should_stop(Facing::Rear, true, &state));
    }

    #[test]
    fn release_rearms_only_matching_segment() {
        let latch = StopLatch::new();
        let state = moving(Direction::Forward, 3);
        assert!(latch.should_stop(Facing::Front, true, &state));
        latch.release(Facing::Front, 2);
        assert!(!latch.is_armed(Facing::Front, 3));
        latch.release(Facing::Front, 3);
        assert!(latch.should_stop(Facing::Front, true, &state));
    }

    #[test]
    fn concurrent_workers_win_at_most_once() {
        use std::sync::Arc;
        let latch = Arc::new(StopLatch::new());
        let state = moving(Direction::Forward, 9);
        let wins: usize = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.should_stop(Facing::Front, true, &state))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }
}
