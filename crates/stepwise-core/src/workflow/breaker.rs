//! Circuit breakers and failure counters, one per step type.
//!
//! A breaker opens after `threshold` consecutive failed attempts of a step
//! type. While open, dispatches of that type fail at once without calling the
//! handler. After `cooldown` one trial attempt is admitted (half-open): its
//! success closes the circuit, its failure opens it again.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// State of one step type's circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Failure statistics for one step type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepTypeStats {
    pub step_type: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Handler invocations, retries included.
    pub attempts: u64,
    pub failures: u64,
    /// Attempts refused because the circuit was open.
    pub rejected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Breaker {
    stats: StepTypeStats,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Breakers keyed by step type. A `threshold` of 0 never opens a circuit but
/// still counts failures.
#[derive(Debug)]
pub struct StepBreakers {
    threshold: u32,
    cooldown: Duration,
    breakers: DashMap<String, Breaker>,
}

impl StepBreakers {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            breakers: DashMap::new(),
        }
    }

    /// Whether an attempt of `step_type` may run now. A refusal is counted.
    pub fn try_acquire(&self, step_type: &str) -> bool {
        self.try_acquire_at(step_type, Instant::now())
    }

    fn try_acquire_at(&self, step_type: &str, now: Instant) -> bool {
        let Some(mut breaker) = self.breakers.get_mut(step_type) else {
            return true;
        };
        let state = breaker.stats.state;
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = breaker
                    .opened_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.cooldown);
                if cooled {
                    tracing::info!(step_type, "circuit half-open, admitting a trial attempt");
                    breaker.stats.state = CircuitState::HalfOpen;
                    breaker.trial_in_flight = true;
                    true
                } else {
                    breaker.stats.rejected += 1;
                    false
                }
            }
            CircuitState::HalfOpen if !breaker.trial_in_flight => {
                breaker.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                breaker.stats.rejected += 1;
                false
            }
        }
    }

    pub fn record_success(&self, step_type: &str) {
        let mut breaker = self.breakers.entry(step_type.to_string()).or_default();
        breaker.stats.attempts += 1;
        breaker.stats.consecutive_failures = 0;
        breaker.trial_in_flight = false;
        breaker.opened_at = None;
        if breaker.stats.state != CircuitState::Closed {
            tracing::info!(step_type, "circuit closed");
            breaker.stats.state = CircuitState::Closed;
        }
    }

    pub fn record_failure(&self, step_type: &str, error: &str) {
        self.record_failure_at(step_type, error, Instant::now());
    }

    fn record_failure_at(&self, step_type: &str, error: &str, now: Instant) {
        let mut breaker = self.breakers.entry(step_type.to_string()).or_default();
        let stats = &mut breaker.stats;
        stats.attempts += 1;
        stats.failures += 1;
        stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
        stats.last_error = Some(error.to_string());
        stats.last_failure_at = Some(Utc::now());

        let trips = self.threshold > 0
            && (stats.state == CircuitState::HalfOpen
                || (stats.state == CircuitState::Closed
                    && stats.consecutive_failures >= self.threshold));
        breaker.trial_in_flight = false;
        if trips {
            tracing::warn!(
                step_type,
                consecutive_failures = breaker.stats.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened"
            );
            breaker.stats.state = CircuitState::Open;
            breaker.opened_at = Some(now);
        }
    }

    pub fn state(&self, step_type: &str) -> CircuitState {
        self.breakers
            .get(step_type)
            .map_or(CircuitState::Closed, |b| b.stats.state)
    }

    /// Statistics for one step type, or for every step type seen so far
    /// sorted by name.
    pub fn statistics(&self, step_type: Option<&str>) -> Vec<StepTypeStats> {
        let mut stats: Vec<StepTypeStats> = self
            .breakers
            .iter()
            .filter(|entry| step_type.is_none_or(|t| entry.key() == t))
            .map(|entry| StepTypeStats {
                step_type: entry.key().clone(),
                ..entry.value().stats.clone()
            })
            .collect();
        stats.sort_by(|a, b| a.step_type.cmp(&b.step_type));
        stats
    }
}
