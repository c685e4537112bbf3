//! Circuit breaker for a single outbound call path
//!
//! Tracks a rolling success/failure window, trips open on sustained failure,
//! and recovers through half-open probing. Provides isolation, not recovery:
//! it never retries on the caller's behalf.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent of the rolling window) that trips the circuit.
    pub failure_threshold: f64,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// How long an open circuit rejects before allowing a probe.
    pub timeout: Duration,
    /// Rolling window over which the failure rate is computed.
    pub monitoring_period: Duration,
    /// Minimum samples in the window before the rate is evaluated.
    pub volume_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 50.0,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            volume_threshold: 10,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
///
/// `Open` is a rejection: the operation was never invoked and no failure was
/// recorded. It means "retry later", never "permanently failed".
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of a breaker, for monitoring surfaces.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

struct BreakerInner {
    state: CircuitState,
    /// Rolling window of (sample time, success?) pruned to the monitoring period.
    window: VecDeque<(Instant, bool)>,
    last_opened_at: Option<Instant>,
    half_open_successes: u32,
    successes: u64,
    failures: u64,
    rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            last_opened_at: None,
            half_open_successes: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
        }
    }

    fn prune(&mut self, monitoring_period: Duration) {
        let now = Instant::now();
        while let Some((t, _)) = self.window.front() {
            if now.duration_since(*t) > monitoring_period {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.window.len() as f64 * 100.0
    }

    fn open(&mut self, name: &str) {
        self.state = CircuitState::Open;
        self.last_opened_at = Some(Instant::now());
        warn!(
            breaker = %name,
            failure_rate = self.failure_rate(),
            samples = self.window.len(),
            "circuit opened"
        );
    }

    /// Evaluated only in Closed, and only once the volume floor is met, so a
    /// cold window of one or two failures cannot flap the circuit.
    fn maybe_open(&mut self, config: &CircuitBreakerConfig, name: &str) {
        if self.window.len() < config.volume_threshold {
            return;
        }
        if self.failure_rate() >= config.failure_threshold {
            self.open(name);
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Run `op` under the breaker, or fail fast with [`BreakerError::Open`]
    /// without invoking it.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock();
            inner.prune(self.config.monitoring_period);

            if inner.state == CircuitState::Open {
                let probe_due = match inner.last_opened_at {
                    Some(opened) => opened.elapsed() >= self.config.timeout,
                    None => true,
                };
                if !probe_due {
                    inner.rejections += 1;
                    return Err(BreakerError::Open);
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                debug!(breaker = %self.name, "circuit half-open, probing");
            }
        }

        let result = op().await;

        let mut inner = self.inner.lock();
        inner.window.push_back((Instant::now(), result.is_ok()));
        match &result {
            Ok(_) => {
                inner.successes += 1;
                match inner.state {
                    CircuitState::HalfOpen => {
                        inner.half_open_successes += 1;
                        if inner.half_open_successes >= self.config.success_threshold {
                            inner.state = CircuitState::Closed;
                            inner.half_open_successes = 0;
                            inner.window.clear();
                            debug!(breaker = %self.name, "circuit closed");
                        }
                    }
                    // A success can still complete the volume floor while the
                    // window is already past the failure threshold.
                    CircuitState::Closed => inner.maybe_open(&self.config, &self.name),
                    CircuitState::Open => {}
                }
            }
            Err(_) => {
                inner.failures += 1;
                match inner.state {
                    // One failed probe reopens immediately and restarts the timeout.
                    CircuitState::HalfOpen => inner.open(&self.name),
                    CircuitState::Closed => inner.maybe_open(&self.config, &self.name),
                    CircuitState::Open => {}
                }
            }
        }

        result.map_err(BreakerError::Inner)
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Operational override, also used by tests to reach a state directly.
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        if state == CircuitState::Open {
            inner.last_opened_at = Some(Instant::now());
        }
        if state == CircuitState::HalfOpen {
            inner.half_open_successes = 0;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            successes: inner.successes,
            failures: inner.failures,
            rejections: inner.rejections,
        }
    }
}

/// Hands out one breaker per destination so unrelated endpoints never share
/// failure windows.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, destination: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(destination.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(destination, self.config.clone()))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|e| e.value().snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 50.0,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            monitoring_period: Duration::from_secs(10),
            volume_threshold: 5,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        breaker
            .execute(|| async { Err::<(), _>("boom".to_string()) })
            .await
            .map(|_| ())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        breaker.execute(|| async { Ok::<_, String>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_with_volume_floor() {
        let breaker = CircuitBreaker::new("test", test_config());

        // Below the volume floor nothing trips, even at 100% failure.
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.force_state(CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.snapshot().rejections, 1);
    }

    #[tokio::test]
    async fn test_half_open_probe_and_recovery() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.force_state(CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First call after the timeout runs as a probe.
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // success_threshold consecutive successes close the circuit.
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.force_state(CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = fail(&breaker).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        // The reopen resets the clock, so the next call is rejected again.
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_mixed_outcomes_below_threshold_stay_closed() {
        let breaker = CircuitBreaker::new("test", test_config());

        // 2 failures out of 6 samples = 33%, under the 50% threshold.
        for i in 0..6 {
            if i % 3 == 0 {
                let _ = fail(&breaker).await;
            } else {
                let _ = succeed(&breaker).await;
            }
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_reuses_breaker_per_destination() {
        let registry = BreakerRegistry::new(test_config());

        let a = registry.get("https://a.example.com/hook");
        let b = registry.get("https://b.example.com/hook");
        a.force_state(CircuitState::Open);

        assert_eq!(
            registry.get("https://a.example.com/hook").state(),
            CircuitState::Open
        );
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(registry.snapshots().len(), 2);
    }
}
