//! Circuit breaker for remote backends.
//!
//! Wraps the HTTP vector index and graph service calls. After
//! `failure_threshold` consecutive failures the circuit opens and
//! callers go straight to their fallback; once the cooldown elapses a
//! single probe is let through to test recovery.

use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

/// Observable breaker state, reported in response metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: RwLock::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// An open circuit flips to half-open once the cooldown has
    /// elapsed, which admits the probing call.
    pub async fn allow(&self) -> bool {
        let mut inner = self.inner.write().await;
        match &*inner {
            Inner::Closed { .. } | Inner::HalfOpen => true,
            Inner::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    info!(breaker = %self.name, "Circuit breaker half-open, probing backend");
                    *inner = Inner::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match &*inner {
            Inner::Closed { failures: 0 } => {}
            Inner::Closed { .. } => {
                *inner = Inner::Closed { failures: 0 };
            }
            Inner::Open { .. } | Inner::HalfOpen => {
                info!(breaker = %self.name, "Circuit breaker closed");
                *inner = Inner::Closed { failures: 0 };
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        match &*inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures,
                        "Circuit breaker opened"
                    );
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen => {
                warn!(breaker = %self.name, "Probe failed, circuit breaker reopened");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        match &*self.inner.read().await {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}
