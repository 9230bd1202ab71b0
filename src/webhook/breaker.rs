//! Per-host circuit breaker
//!
//! State is process-local by design: each worker process makes independent
//! breaker decisions from its own evidence, and no cross-process consistency
//! is attempted.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::observability::Metrics;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Deliveries attempted; consecutive failures counted
    Closed,
    /// Deliveries short-circuit until the reset timeout elapses
    Open,
    /// One probe delivery allowed
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

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip Closed → Open
    pub fail_threshold: u32,
    /// Time an Open circuit waits before allowing a Half-Open probe
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Breaker for a single destination host
pub struct HostBreaker {
    host: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<Metrics>,
}

impl HostBreaker {
    fn new(host: String, config: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            host,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            metrics,
        }
    }

    /// Whether a delivery may proceed. An Open circuit whose reset timeout
    /// has elapsed moves to Half-Open and admits the probe.
    pub fn can_proceed(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    debug!(host = %self.host, "circuit open, short-circuiting delivery");
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Closed),
            CircuitState::Open => {}
        }
    }

    /// One exhausted delivery counts as a single failure
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.fail_threshold {
                    warn!(
                        host = %self.host,
                        failures = inner.consecutive_failures,
                        "failure threshold reached"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {}
        }
        self.metrics
            .breaker_transition(&self.host, from.as_str(), to.as_str());
    }
}

/// Breaker registry, one breaker per destination host
pub struct BreakerRegistry {
    config: BreakerConfig,
    metrics: Arc<Metrics>,
    hosts: RwLock<HashMap<String, Arc<HostBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            hosts: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self, host: &str) -> Arc<HostBreaker> {
        if let Some(breaker) = self.hosts.read().get(host) {
            return Arc::clone(breaker);
        }
        let mut hosts = self.hosts.write();
        Arc::clone(hosts.entry(host.to_string()).or_insert_with(|| {
            Arc::new(HostBreaker::new(
                host.to_string(),
                self.config,
                Arc::clone(&self.metrics),
            ))
        }))
    }

    /// Current state for a host, if it has been seen
    pub fn state_of(&self, host: &str) -> Option<CircuitState> {
        self.hosts.read().get(host).map(|b| b.state())
    }
}
