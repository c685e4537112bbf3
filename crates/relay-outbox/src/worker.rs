//! Outbox delivery worker
//!
//! Polls the durable outbox, leases a batch, and delivers each event to its
//! matching subscriptions with signed POSTs. At-least-once delivery rests on
//! the store-side lease: any number of workers can run this loop, and a
//! lease that expires before completion makes the row reclaimable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use relay_common::{DeliveryOutcome, OutboxEvent, Subscription};
use relay_resilience::{
    AdaptiveRateLimiter, BreakerError, BreakerRegistry, CircuitBreakerConfig, RateLimiterConfig,
};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{
    canonical_body, classify_status, retry_backoff, AttemptDisposition, DispatchError,
    WebhookDispatcher, WebhookResponse,
};
use crate::metrics::DeliveryMetrics;
use crate::store::{OutboxStore, SubscriptionStore};

#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    pub poll_interval: Duration,
    pub batch_limit: u32,
    /// How long a claimed row stays exclusive to this worker.
    pub lease: Duration,
    /// Attempt ceiling; reaching it dead-letters the event regardless of
    /// error class.
    pub max_attempts: i32,
    /// Used when a subscription does not set its own in-flight cap.
    pub default_max_in_flight: u32,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_limit: 100,
            lease: Duration::from_secs(30),
            max_attempts: 8,
            default_max_in_flight: 4,
        }
    }
}

/// Send failure surfaced through the circuit breaker. A 5xx counts as a
/// breaker failure just like a transport error; everything else is a
/// breaker success even when the delivery itself will not proceed.
#[derive(Debug, thiserror::Error)]
enum SendFailure {
    #[error(transparent)]
    Transport(#[from] DispatchError),
    #[error("upstream returned {}", .0.status)]
    Upstream(WebhookResponse),
}

pub struct DeliveryWorker {
    outbox: Arc<dyn OutboxStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    dispatcher: WebhookDispatcher,
    config: DeliveryWorkerConfig,
    /// Process-local in-flight deliveries per subscription id. Approximate
    /// under multi-worker deployments; the cap is advisory.
    in_flight: DashMap<String, u32>,
    breakers: BreakerRegistry,
    limiter: AdaptiveRateLimiter,
    metrics: Arc<DeliveryMetrics>,
}

impl DeliveryWorker {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        dispatcher: WebhookDispatcher,
        config: DeliveryWorkerConfig,
    ) -> Self {
        Self {
            outbox,
            subscriptions,
            dispatcher,
            config,
            in_flight: DashMap::new(),
            breakers: BreakerRegistry::new(CircuitBreakerConfig::default()),
            limiter: AdaptiveRateLimiter::new(RateLimiterConfig::default()),
            metrics: Arc::new(DeliveryMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        self.metrics.clone()
    }

    /// Poll until the task is cancelled.
    pub async fn start(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_limit = self.config.batch_limit,
            lease_s = self.config.lease.as_secs(),
            max_attempts = self.config.max_attempts,
            "starting outbox delivery worker"
        );
        loop {
            if let Err(e) = self.run_cycle().await {
                // Nothing was claimed, so nothing is lost; next tick retries.
                error!(error = %e, "outbox claim failed");
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Claim one batch and process every event in it concurrently. Returns
    /// how many events were claimed.
    pub async fn run_cycle(&self) -> Result<usize> {
        let events = self
            .outbox
            .claim_pending(self.config.batch_limit, self.config.lease)
            .await?;
        if events.is_empty() {
            return Ok(0);
        }

        let claimed = events.len();
        debug!(claimed, "processing claimed batch");

        let results =
            futures::future::join_all(events.into_iter().map(|event| async move {
                let event_id = event.id.clone();
                (event_id, self.deliver_event(event).await)
            }))
            .await;

        for (event_id, result) in results {
            if let Err(e) = result {
                // Leave the row leased; lease expiry will return it to the
                // next claim.
                error!(event_id = %event_id, error = %e, "event delivery pass failed");
            }
        }

        Ok(claimed)
    }

    /// One delivery pass over an event's subscribers. Subscribers run
    /// sequentially; the first retry signal reschedules the whole event and
    /// ends the pass so the retry decision stays unambiguous.
    async fn deliver_event(&self, event: OutboxEvent) -> Result<()> {
        let subscriptions = self
            .subscriptions
            .active_for(&event.org_id, &event.topic)
            .await?;

        if subscriptions.is_empty() {
            // Nothing to notify is still a completed delivery.
            debug!(event_id = %event.id, topic = %event.topic, "no matching subscriptions");
            self.outbox.mark_delivered(&event.id).await?;
            self.metrics.record_delivered();
            return Ok(());
        }

        let body = canonical_body(&event)?;

        for subscription in &subscriptions {
            let max_in_flight = if subscription.max_in_flight > 0 {
                subscription.max_in_flight
            } else {
                self.config.default_max_in_flight
            };

            if self.current_in_flight(&subscription.id) >= max_in_flight {
                warn!(
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    max_in_flight,
                    "subscription saturated, rescheduling event"
                );
                self.reschedule_shortly(&event.id).await?;
                return Ok(());
            }
            let _guard = InFlightGuard::acquire(&self.in_flight, &subscription.id);

            self.limiter.acquire(&subscription.endpoint_url).await;

            let breaker = self.breakers.get(&subscription.endpoint_url);
            let started = Instant::now();
            let send_result = breaker
                .execute(|| async {
                    let response = self.dispatcher.send(subscription, &event, &body).await?;
                    if response.status >= 500 {
                        return Err(SendFailure::Upstream(response));
                    }
                    Ok(response)
                })
                .await;

            let (status_code, http_error, disposition) = match send_result {
                Err(BreakerError::Open) => {
                    // The operation never ran: no network call, no attempt
                    // to record. Fast-fail means "retry later".
                    warn!(
                        event_id = %event.id,
                        endpoint = %subscription.endpoint_url,
                        "circuit open, rescheduling event"
                    );
                    self.reschedule_shortly(&event.id).await?;
                    return Ok(());
                }
                Ok(response) => {
                    self.metrics.observe_attempt(started.elapsed());
                    let disposition = classify_status(response.status, response.retry_after);
                    (Some(response.status), None, disposition)
                }
                Err(BreakerError::Inner(SendFailure::Upstream(response))) => {
                    self.metrics.observe_attempt(started.elapsed());
                    (
                        Some(response.status),
                        Some(format!("server error: HTTP {}", response.status)),
                        AttemptDisposition::RetryBackoff,
                    )
                }
                Err(BreakerError::Inner(SendFailure::Transport(e))) => {
                    (None, Some(e.to_string()), AttemptDisposition::RetryBackoff)
                }
            };

            // The attempt is recorded whatever happens next, so counters and
            // last-error stay current even when the event is rescheduled.
            let attempts = self
                .outbox
                .record_attempt(&event.id, status_code, http_error.as_deref())
                .await?;
            let outcome = DeliveryOutcome {
                status_code,
                error: http_error,
                attempt_number: attempts.max(0) as u32,
            };

            match disposition {
                AttemptDisposition::Delivered => {
                    debug!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        attempt = outcome.attempt_number,
                        "subscriber acknowledged"
                    );
                }
                AttemptDisposition::Dead => {
                    warn!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        status = ?outcome.status_code,
                        "destination rejected event, dead-lettering"
                    );
                    self.outbox
                        .mark_dead(&event.id, outcome.status_code, outcome.error.as_deref())
                        .await?;
                    self.metrics.record_dead();
                    return Ok(());
                }
                AttemptDisposition::RetryAfter { delay } => {
                    self.limiter.handle_429(&subscription.endpoint_url, delay);
                    return self.retry_or_dead(&event, subscription, &outcome, delay).await;
                }
                AttemptDisposition::RetryBackoff => {
                    let delay = retry_backoff(attempts);
                    return self.retry_or_dead(&event, subscription, &outcome, delay).await;
                }
            }
        }

        self.outbox.mark_delivered(&event.id).await?;
        self.metrics.record_delivered();
        debug!(
            event_id = %event.id,
            subscribers = subscriptions.len(),
            "event delivered to all subscribers"
        );
        Ok(())
    }

    /// Retry with `delay`, unless the attempt budget is exhausted, which
    /// dead-letters the event regardless of how it failed.
    async fn retry_or_dead(
        &self,
        event: &OutboxEvent,
        subscription: &Subscription,
        outcome: &DeliveryOutcome,
        delay: Duration,
    ) -> Result<()> {
        if (outcome.attempt_number as i32) >= self.config.max_attempts {
            warn!(
                event_id = %event.id,
                attempts = outcome.attempt_number,
                "attempt budget exhausted, dead-lettering"
            );
            self.outbox
                .mark_dead(&event.id, outcome.status_code, outcome.error.as_deref())
                .await?;
            self.metrics.record_dead();
            return Ok(());
        }

        let retry_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        debug!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            attempt = outcome.attempt_number,
            delay_s = delay.as_secs(),
            status = ?outcome.status_code,
            "delivery attempt failed, retry scheduled"
        );
        self.outbox.schedule_retry(&event.id, retry_at).await?;
        Ok(())
    }

    /// Short randomized retry used when no attempt was actually made
    /// (saturated subscription, open circuit). Smooths bursts instead of
    /// spinning locally.
    async fn reschedule_shortly(&self, event_id: &str) -> Result<()> {
        let delay_s = 2 + rand::thread_rng().gen_range(0..3);
        let retry_at = Utc::now() + chrono::Duration::seconds(delay_s);
        self.outbox.schedule_retry(event_id, retry_at).await
    }

    fn current_in_flight(&self, subscription_id: &str) -> u32 {
        self.in_flight
            .get(subscription_id)
            .map(|v| *v)
            .unwrap_or(0)
    }
}

/// Increments a subscription's in-flight count for the lifetime of one
/// delivery attempt.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, u32>,
    key: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(map: &'a DashMap<String, u32>, key: &str) -> Self {
        *map.entry(key.to_string()).or_insert(0) += 1;
        Self {
            map,
            key: key.to_string(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let emptied = {
            match self.map.get_mut(&self.key) {
                Some(mut entry) => {
                    *entry = entry.saturating_sub(1);
                    *entry == 0
                }
                None => false,
            }
        };
        if emptied {
            self.map.remove_if(&self.key, |_, v| *v == 0);
        }
    }
}
