//! Closed / open / half-open breaker guarding one AI provider.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open { .. } => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failures: u32,
    successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    open_for: Duration,
    inner: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        open_for: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_for,
            inner: Mutex::new(Counters {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `fut` unless the circuit is open. An open circuit whose cool-down
    /// has elapsed lets one trial call through as half-open.
    pub async fn call<T, F>(&self, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.before_call()?;
        let result = fut.await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn before_call(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let CircuitState::Open { since } = inner.state {
            if since.elapsed() < self.open_for {
                anyhow::bail!("circuit open for provider {}", self.name);
            }
            info!("Circuit for {} is half-open", self.name);
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.success_threshold {
                    info!("Circuit for {} closed", self.name);
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open { .. } => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    warn!(
                        "Circuit for {} opened after {} failures",
                        self.name, inner.failures
                    );
                    inner.state = CircuitState::Open {
                        since: Instant::now(),
                    };
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit for {} re-opened by failed trial call", self.name);
                inner.state = CircuitState::Open {
                    since: Instant::now(),
                };
                inner.failures = 0;
                inner.successes = 0;
            }
            CircuitState::Open { .. } => {}
        }
    }
}
