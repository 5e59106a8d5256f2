//! Persistence gate: debounces per-frame verdicts into a stable alarm state.
//!
//! The counter moves up by one per danger frame and is capped at the
//! threshold. On a clear frame it either drops by one (`Decrement`) or to zero
//! (`Reset`). The gate confirms once the counter reaches the threshold and
//! stays confirmed until the counter is back at zero, so with `Decrement` a
//! confirmed alarm survives up to `threshold - 1` clear frames.
//!
//! Worst-case reaction latency is `threshold` frame periods.

use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayPolicy {
    /// Any clear frame resets the counter.
    Reset,
    /// Each clear frame removes one unit of evidence.
    Decrement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateSettings {
    /// Danger frames needed to confirm (N). At least 1.
    pub threshold: u32,
    pub decay: DecayPolicy,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            decay: DecayPolicy::Decrement,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Clear,
    Accumulating(u32),
    Confirmed,
}

/// Edge reported by [`PersistenceGate::observe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateTransition {
    None,
    Confirmed,
    Cleared,
}

#[derive(Debug)]
pub struct PersistenceGate {
    settings: GateSettings,
    counter: u32,
    confirmed: bool,
}

impl PersistenceGate {
    pub fn new(settings: GateSettings) -> Self {
        Self {
            settings: GateSettings {
                threshold: settings.threshold.max(1),
                ..settings
            },
            counter: 0,
            confirmed: false,
        }
    }

    pub fn observe(&mut self, is_danger: bool) -> GateTransition {
        if is_danger {
            self.counter = (self.counter + 1).min(self.settings.threshold);
        } else {
            self.counter = match self.settings.decay {
                DecayPolicy::Reset => 0,
                DecayPolicy::Decrement => self.counter.saturating_sub(1),
            };
        }

        if !self.confirmed && self.counter >= self.settings.threshold {
            self.confirmed = true;
            GateTransition::Confirmed
        } else if self.confirmed && self.counter == 0 {
            self.confirmed = false;
            GateTransition::Cleared
        } else {
            GateTransition::None
        }
    }

    pub fn state(&self) -> GateState {
        if self.confirmed {
            GateState::Confirmed
        } else if self.counter == 0 {
            GateState::Clear
        } else {
            GateState::Accumulating(self.counter)
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn settings(&self) -> GateSettings {
        self.settings
    }
}
