//! Adaptive per-destination rate limiter
//!
//! Fixed window counter per destination key with FIFO queuing of waiters and
//! explicit backpressure pausing driven by 429 responses. Single-process and
//! advisory: it delays, it never errors, and it does not coordinate across
//! worker processes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests admitted per destination per window.
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct DestinationState {
    count: u32,
    window_start: Instant,
    pause_until: Option<Instant>,
}

impl DestinationState {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            pause_until: None,
        }
    }

    /// Admit the caller now, or report how long to wait before re-evaluating.
    fn try_admit(&mut self, config: &RateLimiterConfig, now: Instant) -> Option<Duration> {
        if let Some(pause) = self.pause_until {
            if now < pause {
                return Some(pause - now);
            }
            self.pause_until = None;
        }

        if now.duration_since(self.window_start) >= config.window {
            self.window_start = now;
            self.count = 0;
        }

        if self.count < config.max_requests {
            self.count += 1;
            None
        } else {
            Some(self.window_start + config.window - now)
        }
    }
}

struct Destination {
    /// Tokio's mutex queues waiters fairly, which is what gives acquisitions
    /// their FIFO order under contention.
    turnstile: tokio::sync::Mutex<()>,
    state: Mutex<DestinationState>,
}

pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    destinations: DashMap<String, Arc<Destination>>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            destinations: DashMap::new(),
        }
    }

    fn destination(&self, key: &str) -> Arc<Destination> {
        self.destinations
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Destination {
                    turnstile: tokio::sync::Mutex::new(()),
                    state: Mutex::new(DestinationState::new()),
                })
            })
            .clone()
    }

    /// Resolves once the caller may proceed under `key`'s budget. Waits out
    /// any active pause first, then either takes a slot in the current window
    /// or sleeps until the window rolls over.
    pub async fn acquire(&self, key: &str) {
        let dest = self.destination(key);
        let _turn = dest.turnstile.lock().await;

        loop {
            let wait = {
                let mut state = dest.state.lock();
                state.try_admit(&self.config, Instant::now())
            };
            match wait {
                None => return,
                Some(delay) => {
                    debug!(destination = %key, delay_ms = delay.as_millis() as u64, "rate limited, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Record an explicit backpressure signal from the destination. All
    /// pending and future acquisitions for `key` are delayed until the pause
    /// expires.
    pub fn handle_429(&self, key: &str, retry_after: Duration) {
        let dest = self.destination(key);
        let mut state = dest.state.lock();
        let until = Instant::now() + retry_after;
        let until = match state.pause_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        state.pause_until = Some(until);
        warn!(
            destination = %key,
            retry_after_ms = retry_after.as_millis() as u64,
            "destination signaled backpressure, pausing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimiterConfig {
            max_requests,
            window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test]
    async fn test_under_budget_is_immediate() {
        let limiter = limiter(5, 1000);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire("dest").await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_over_budget_waits_for_window_rollover() {
        let limiter = limiter(3, 200);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("dest").await;
        }
        // The fourth acquisition only resolves after the window rolls over.
        limiter.acquire("dest").await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_handle_429_delays_next_acquire() {
        let limiter = limiter(10, 1000);
        limiter.handle_429("dest", Duration::from_millis(300));

        let start = Instant::now();
        limiter.acquire("dest").await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_destinations_are_independent() {
        let limiter = limiter(1, 10_000);
        limiter.acquire("a").await;

        // "a" is out of budget, "b" is untouched.
        let start = Instant::now();
        limiter.acquire("b").await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_pause_never_shortens() {
        let limiter = limiter(10, 1000);
        limiter.handle_429("dest", Duration::from_millis(400));
        limiter.handle_429("dest", Duration::from_millis(50));

        let start = Instant::now();
        limiter.acquire("dest").await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
