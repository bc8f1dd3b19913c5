//! Circuit breaker for the flag store.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: store assumed down, calls fail fast
//! - Half-Open: one probe call tests recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: cool-down elapsed, next caller becomes the probe
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails (cool-down restarts)
//! ```
//!
//! # Design Decisions
//! - Single probe in Half-Open; concurrent callers fail fast meanwhile
//! - A probe abandoned mid-flight (future dropped) frees the slot without
//!   changing state
//! - Only outages count as failures; `NotFound` and friends are answers

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::error::ControlPlaneError;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn gauge(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: i64,
    probe_in_flight: bool,
}

/// Permission to make one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown_millis: i64,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: &CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown_millis: i64::try_from(config.cooldown_ms).unwrap_or(i64::MAX),
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, advancing Open to Half-Open if the cool-down is over.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    fn advance(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && self.clock.now_millis() - inner.opened_at >= self.cooldown_millis
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = self.clock.now_millis();
                tracing::warn!(
                    breaker = %self.name,
                    %from,
                    %to,
                    consecutive_failures = inner.consecutive_failures,
                    cooldown_ms = self.cooldown_millis,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, %from, %to, "Circuit breaker allowing probe");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                tracing::info!(breaker = %self.name, %from, %to, "Circuit breaker recovered");
            }
        }
        metrics::record_circuit_state(&self.name, to.gauge());
    }

    /// Ask to make a call.
    pub fn try_acquire(&self) -> Result<Admission, ControlPlaneError> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
            _ => Err(ControlPlaneError::CircuitOpen(self.name.clone())),
        }
    }

    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission == Admission::Probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::HalfOpen if admission == Admission::Probe => {
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            _ => {}
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission == Admission::Probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::HalfOpen if admission == Admission::Probe => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn abandon(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.inner.lock().probe_in_flight = false;
        }
    }

    /// Run `call` through the breaker. Fails fast with `CircuitOpen`.
    pub async fn call<T, F, Fut>(&self, call: F) -> Result<T, ControlPlaneError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ControlPlaneError>>,
    {
        let admission = self.try_acquire()?;
        let mut guard = ProbeGuard {
            breaker: self,
            admission,
            settled: false,
        };
        let result = call().await;
        guard.settled = true;
        match &result {
            Err(e) if counts_as_failure(e) => self.record_failure(admission),
            _ => self.record_success(admission),
        }
        result
    }
}

fn counts_as_failure(err: &ControlPlaneError) -> bool {
    matches!(err, ControlPlaneError::StoreUnavailable(_))
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.admission);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 10_000,
        };
        CircuitBreaker::new("flags", &config, clock)
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), ControlPlaneError> {
        b.call(|| async { Err::<(), _>(ControlPlaneError::StoreUnavailable("down".into())) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), ControlPlaneError> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let clock = Arc::new(ManualClock::new(0));
        let b = breaker(clock);
        for _ in 0..3 {
            assert!(matches!(
                fail(&b).await,
                Err(ControlPlaneError::StoreUnavailable(_))
            ));
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&b).await,
            Err(ControlPlaneError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_run() {
        let clock = Arc::new(ManualClock::new(0));
        let b = breaker(clock);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_or_reopens() {
        let clock = Arc::new(ManualClock::new(0));
        let b = breaker(clock.clone());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }

        clock.advance_millis(10_000);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance_millis(10_000);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_probe_in_half_open() {
        let clock = Arc::new(ManualClock::new(0));
        let b = breaker(clock.clone());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        clock.advance_millis(10_000);

        let probe = b.try_acquire().unwrap();
        assert_eq!(probe, Admission::Probe);
        assert!(b.try_acquire().is_err());
        b.record_success(probe);
        assert_eq!(b.try_acquire().unwrap(), Admission::Normal);
    }

    #[tokio::test]
    async fn test_non_outage_errors_do_not_trip() {
        let clock = Arc::new(ManualClock::new(0));
        let b = breaker(clock);
        for _ in 0..5 {
            let _ = b
                .call(|| async {
                    Err::<(), _>(ControlPlaneError::InvalidRequest("bad".into()))
                })
                .await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
