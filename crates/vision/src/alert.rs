//! Per-detector alert cooldown.
//!
//! A gate is either quiet (ready to fire) or cooling. There is no timer: the
//! cooldown is re-evaluated lazily on the next [`AlertGate::try_fire`] call,
//! so a detector that stops firing simply becomes ready once the cooldown has
//! elapsed.

use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Quiet,
    Cooling,
}

#[derive(Clone, Debug)]
pub struct AlertGate {
    cooldown: Duration,
    last_fired: Option<Instant>,
}

impl Default for AlertGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl AlertGate {
    /// A fresh gate behaves as if it last fired infinitely long ago.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: None,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Fire iff strictly more than `cooldown` has passed since the last fire.
    ///
    /// On success `now` becomes the new reference point; on failure nothing
    /// changes. Delivery outcome of the resulting alert is irrelevant here.
    pub fn try_fire(&mut self, now: Instant) -> bool {
        let ready = match self.last_fired {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.cooldown,
        };
        if ready {
            self.last_fired = Some(now);
        }
        ready
    }

    pub fn state(&self, now: Instant) -> GateState {
        match self.last_fired {
            Some(last) if now.saturating_duration_since(last) <= self.cooldown => {
                GateState::Cooling
            }
            _ => GateState::Quiet,
        }
    }

    pub fn last_fired(&self) -> Option<Instant> {
        self.last_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn first_event_always_fires() {
        let mut gate = AlertGate::new(secs(5));
        let now = Instant::now();
        assert_eq!(gate.state(now), GateState::Quiet);
        assert!(gate.try_fire(now));
        assert_eq!(gate.state(now), GateState::Cooling);
    }

    #[test]
    fn suppresses_within_cooldown_and_fires_after() {
        let t0 = Instant::now();
        let mut gate = AlertGate::new(secs(5));

        let fired: Vec<bool> = [0, 3, 6]
            .iter()
            .map(|offset| gate.try_fire(t0 + secs(*offset)))
            .collect();

        assert_eq!(fired, vec![true, false, true]);
        assert_eq!(gate.last_fired(), Some(t0 + secs(6)));
    }

    #[test]
    fn suppressed_attempt_does_not_extend_cooldown() {
        let t0 = Instant::now();
        let mut gate = AlertGate::new(secs(5));
        assert!(gate.try_fire(t0));
        assert!(!gate.try_fire(t0 + secs(4)));
        // Measured from t0, not from the suppressed attempt at t0+4.
        assert!(gate.try_fire(t0 + Duration::from_millis(5_001)));
    }

    #[test]
    fn exact_cooldown_boundary_is_still_cooling() {
        let t0 = Instant::now();
        let mut gate = AlertGate::new(secs(5));
        assert!(gate.try_fire(t0));
        assert!(!gate.try_fire(t0 + secs(5)));
        assert_eq!(gate.state(t0 + secs(5)), GateState::Cooling);
    }

    #[test]
    fn zero_cooldown_fires_on_any_later_instant() {
        let t0 = Instant::now();
        let mut gate = AlertGate::new(Duration::ZERO);
        assert!(gate.try_fire(t0));
        assert!(!gate.try_fire(t0));
        assert!(gate.try_fire(t0 + Duration::from_millis(1)));
    }
}
