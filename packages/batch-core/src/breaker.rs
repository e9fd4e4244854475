//! Circuit breaker over consecutive fatal failures.
//!
//! Shared across all units of one engine run. Only fatal LM outcomes
//! (including retryable errors whose retry budget ran out) count; parse
//! errors and render errors do not. A threshold of zero disables the
//! breaker entirely.

use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_error: Option<String>,
    last_failing_unit: Option<u64>,
}

/// Consistent point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub last_error: Option<String>,
    pub last_failing_unit: Option<u64>,
    pub tripped: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a fatal outcome for the given unit.
    pub fn record_failure(&self, error: &str, unit_index: u64) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures += 1;
        state.last_error = Some(error.to_string());
        state.last_failing_unit = Some(unit_index);
    }

    /// Record a successful completion; clears the failure streak.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = BreakerState::default();
    }

    /// Manual reset after a trip; identical to `record_success`.
    pub fn reset(&self) {
        self.record_success();
    }

    pub fn is_tripped(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures >= self.threshold
    }

    pub fn status(&self) -> BreakerSnapshot {
        let state = self.state.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            consecutive_failures: state.consecutive_failures,
            threshold: self.threshold,
            last_error: state.last_error.clone(),
            last_failing_unit: state.last_failing_unit,
            tripped: self.threshold > 0 && state.consecutive_failures >= self.threshold,
        }
    }
}
