//! Per-source alert cooldown.
//!
//! A trigger is permitted when the source has never alerted, or when
//! strictly more than `cooldown` has elapsed since the last permitted
//! trigger. The check and the update of `last_alert_at` happen under one
//! per-source mutex, so concurrent attempts for the same source yield a
//! single permit. Gates never share state across sources.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;
use crate::SourceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerDecision {
    Permitted,
    Suppressed,
}

#[derive(Debug)]
pub struct AlertGate {
    source: SourceId,
    cooldown: Duration,
    last_alert_at: Mutex<Option<Instant>>,
}

impl AlertGate {
    /// New gate in the "never alerted" state.
    pub fn new(source: SourceId, cooldown: Duration) -> Self {
        Self {
            source,
            cooldown,
            last_alert_at: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn last_alert_at(&self) -> Option<Instant> {
        *lock(&self.last_alert_at)
    }

    /// Atomically decide whether a sighting at `now` may fire side effects.
    ///
    /// `last_alert_at` only moves on `Permitted`; suppressed attempts never
    /// extend the window. A `now` earlier than the last alert is suppressed.
    pub fn try_trigger(&self, now: Instant) -> TriggerDecision {
        let mut last = lock(&self.last_alert_at);
        let permitted = match *last {
            None => true,
            Some(prev) => now
                .checked_duration_since(prev)
                .is_some_and(|elapsed| elapsed > self.cooldown),
        };
        if permitted {
            *last = Some(now);
            TriggerDecision::Permitted
        } else {
            TriggerDecision::Suppressed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn gate(cooldown_secs: u64) -> AlertGate {
        AlertGate::new(SourceId::new("stub://a"), Duration::from_secs(cooldown_secs))
    }

    #[test]
    fn cooldown_scenario() {
        let gate = gate(10);
        let t0 = Instant::now();
        assert_eq!(gate.try_trigger(t0), TriggerDecision::Permitted);
        assert_eq!(
            gate.try_trigger(t0 + Duration::from_secs(3)),
            TriggerDecision::Suppressed
        );
        assert_eq!(
            gate.try_trigger(t0 + Duration::from_secs(11)),
            TriggerDecision::Permitted
        );
        assert_eq!(gate.last_alert_at(), Some(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn exact_cooldown_boundary_is_suppressed() {
        let gate = gate(10);
        let t0 = Instant::now();
        gate.try_trigger(t0);
        assert_eq!(
            gate.try_trigger(t0 + Duration::from_secs(10)),
            TriggerDecision::Suppressed
        );
    }

    #[test]
    fn suppressed_attempts_do_not_slide_the_window() {
        let gate = gate(10);
        let t0 = Instant::now();
        gate.try_trigger(t0);
        for secs in 1..=10 {
            assert_eq!(
                gate.try_trigger(t0 + Duration::from_secs(secs)),
                TriggerDecision::Suppressed
            );
        }
        assert_eq!(gate.last_alert_at(), Some(t0));
        assert_eq!(
            gate.try_trigger(t0 + Duration::from_millis(10_001)),
            TriggerDecision::Permitted
        );
    }

    #[test]
    fn zero_cooldown_needs_time_to_advance() {
        let gate = gate(0);
        let t0 = Instant::now();
        assert_eq!(gate.try_trigger(t0), TriggerDecision::Permitted);
        assert_eq!(gate.try_trigger(t0), TriggerDecision::Suppressed);
        assert_eq!(
            gate.try_trigger(t0 + Duration::from_millis(1)),
            TriggerDecision::Permitted
        );
    }

    #[test]
    fn earlier_instant_is_suppressed() {
        let gate = gate(1);
        let t0 = Instant::now() + Duration::from_secs(60);
        gate.try_trigger(t0);
        assert_eq!(
            gate.try_trigger(t0 - Duration::from_secs(30)),
            TriggerDecision::Suppressed
        );
        assert_eq!(gate.last_alert_at(), Some(t0));
    }

    #[test]
    fn concurrent_attempts_yield_one_permit() {
        let gate = Arc::new(gate(300));
        let now = Instant::now();
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.try_trigger(now)
                })
            })
            .collect();

        let permitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|d| *d == TriggerDecision::Permitted)
            .count();
        assert_eq!(permitted, 1);
    }

    #[test]
    fn gates_are_independent_per_source() {
        let a = gate(300);
        let b = AlertGate::new(SourceId::new("stub://b"), Duration::from_secs(300));
        let now = Instant::now();
        assert_eq!(a.try_trigger(now), TriggerDecision::Permitted);
        assert_eq!(b.try_trigger(now), TriggerDecision::Permitted);
    }
}
