//! Circuit breaker guarding publish calls to a backend.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use serde::Serialize;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Calls pass through
    Closed = 0,
    /// Calls are refused until the reset timeout elapses
    Open = 1,
    /// A limited number of trial calls are let through
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time spent open before probing (ms)
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Lock-free circuit breaker.
///
/// One breaker is owned by each backend pool; `name` only labels log lines.
pub struct CircuitBreaker {
    name: &'static str,
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    changed_at_ms: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            changed_at_ms: AtomicI64::new(current_time_ms()),
            config,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state, moving `Open` to `HalfOpen` once the reset timeout has passed.
    pub fn state(&self) -> CircuitState {
        self.maybe_half_open();
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        match CircuitState::from_u8(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.set_state(CircuitState::Closed);
                    tracing::info!(backend = self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match CircuitState::from_u8(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.set_state(CircuitState::Open);
                    tracing::warn!(backend = self.name, failures, "Circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                self.set_state(CircuitState::Open);
                tracing::warn!(backend = self.name, "Circuit breaker reopened by failed trial call");
            }
            CircuitState::Open => {
                self.changed_at_ms.store(current_time_ms(), Ordering::Release);
            }
        }
    }

    fn maybe_half_open(&self) {
        if self.state.load(Ordering::Acquire) != CircuitState::Open as u8 {
            return;
        }

        let elapsed = current_time_ms() - self.changed_at_ms.load(Ordering::Acquire);
        if elapsed < self.config.reset_timeout_ms as i64 {
            return;
        }

        let swapped = self.state.compare_exchange(
            CircuitState::Open as u8,
            CircuitState::HalfOpen as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            self.successes.store(0, Ordering::Release);
            self.changed_at_ms.store(current_time_ms(), Ordering::Release);
            tracing::info!(backend = self.name, "Circuit breaker half-open, probing");
        }
    }

    fn set_state(&self, next: CircuitState) {
        self.state.store(next as u8, Ordering::Release);
        self.changed_at_ms.store(current_time_ms(), Ordering::Release);
        self.successes.store(0, Ordering::Release);
        if next == CircuitState::Closed {
            self.failures.store(0, Ordering::Release);
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failure_count: self.failures.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
}
