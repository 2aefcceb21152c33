//! Per-agent circuit breaker.
//!
//! `Closed` admits everything. Enough failures open the circuit and the agent
//! is skipped until its cooldown elapses; the next admission then moves it to
//! `HalfOpen` and lets exactly one probe through. A successful probe closes
//! the circuit; a failed one re-opens it with the cooldown doubled.
//!
//! Time is passed in explicitly as [`tokio::time::Instant`] so callers can
//! drive the breaker from a paused test clock.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u64,
    pub half_open_successes: u64,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    opened_at: Option<Instant>,
    hold_until: Option<Instant>,
    cooldown: Duration,
    base_cooldown: Duration,
    max_cooldown: Duration,
    failure_threshold: u32,
    window_failures: u32,
    window: Duration,
    consecutive_failures: u32,
    recent_failures: VecDeque<Instant>,
    failure_count: u64,
    half_open_successes: u64,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            hold_until: None,
            cooldown: config.cooldown(),
            base_cooldown: config.cooldown(),
            max_cooldown: config.max_cooldown(),
            failure_threshold: config.failure_threshold,
            window_failures: config.window_failures,
            window: config.window(),
            consecutive_failures: 0,
            recent_failures: VecDeque::new(),
            failure_count: 0,
            half_open_successes: 0,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Earliest instant at which an open circuit admits a probe.
    pub fn ready_at(&self) -> Option<Instant> {
        let opened_at = self.opened_at?;
        let after_cooldown = opened_at + self.cooldown;
        Some(match self.hold_until {
            Some(hold) if hold > after_cooldown => hold,
            _ => after_cooldown,
        })
    }

    /// Whether an open circuit would move to `HalfOpen` on the next admission.
    pub fn probe_due(&self, now: Instant) -> bool {
        self.state == CircuitState::Open && self.ready_at().is_some_and(|ready| now >= ready)
    }

    /// Asks for permission to dispatch. In `HalfOpen` only the first caller
    /// gets through until an outcome is recorded or the probe is released.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.probe_due(now) {
                    return false;
                }
                self.state = CircuitState::HalfOpen;
                self.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    return false;
                }
                self.probe_in_flight = true;
                true
            }
        }
    }

    /// Gives back an admitted probe that never produced an outcome.
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.half_open_successes += 1;
            self.close();
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.failure_count += 1;
        self.recent_failures.push_back(now);
        self.prune(now);

        match self.state {
            CircuitState::Closed => {
                let windowed = self.recent_failures.len() as u32;
                if self.consecutive_failures >= self.failure_threshold
                    || windowed >= self.window_failures
                {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                self.cooldown = (self.cooldown * 2).min(self.max_cooldown);
                self.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Opens the circuit regardless of counters, optionally holding it open
    /// for at least `hold`.
    pub fn trip(&mut self, now: Instant, hold: Option<Duration>) {
        self.hold_until = hold.and_then(|hold| now.checked_add(hold));
        if self.state != CircuitState::Open {
            self.open(now);
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            half_open_successes: self.half_open_successes,
            cooldown_ms: self.cooldown.as_millis() as u64,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.hold_until = None;
        self.cooldown = self.base_cooldown;
        self.probe_in_flight = false;
        self.recent_failures.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.recent_failures.front() {
            if now.duration_since(*oldest) > self.window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&HealthConfig {
            failure_threshold: 3,
            cooldown_ms: 1_000,
            max_cooldown_ms: 3_000,
            ..Default::default()
        })
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow(t0));
    }

    #[test]
    fn opens_on_windowed_failures_even_with_interleaved_successes() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for i in 0..4 {
            cb.record_failure(t0 + secs(i));
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(t0 + secs(5));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn failures_outside_the_window_are_forgotten() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for i in 0..4 {
            cb.record_failure(t0 + secs(i));
            cb.record_success();
        }
        cb.record_failure(t0 + secs(120));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.trip(t0, None);
        assert!(!cb.allow(t0 + Duration::from_millis(999)));

        let later = t0 + secs(1);
        assert!(cb.allow(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow(later));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow(later));
        assert_eq!(cb.snapshot().half_open_successes, 1);
    }

    #[test]
    fn failed_probe_doubles_cooldown_up_to_cap() {
        let mut cb = breaker();
        let mut now = Instant::now();
        cb.trip(now, None);

        for expected in [2_000, 3_000, 3_000] {
            now += cb.cooldown();
            assert!(cb.allow(now));
            cb.record_failure(now);
            assert_eq!(cb.state(), CircuitState::Open);
            assert_eq!(cb.cooldown(), Duration::from_millis(expected));
        }
    }

    #[test]
    fn hold_outlasts_cooldown() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.trip(t0, Some(secs(60)));
        assert!(!cb.allow(t0 + secs(30)));
        assert!(cb.allow(t0 + secs(60)));
    }

    #[test]
    fn released_probe_can_be_retaken() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.trip(t0, None);
        assert!(cb.allow(t0 + secs(1)));
        cb.release_probe();
        assert!(cb.allow(t0 + secs(1)));
    }
}
