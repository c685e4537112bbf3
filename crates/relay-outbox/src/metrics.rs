//! Delivery pipeline observability
//!
//! Counters and a fixed-bucket latency histogram backing the periodic
//! metrics tick, which is the primary signal for detecting a stuck
//! pipeline. Everything here is fire-and-forget: a metrics write or a
//! failed stats query never affects a delivery attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::OutboxStore;

/// Upper bounds of the latency buckets, milliseconds. The final implicit
/// bucket is unbounded.
const LATENCY_BUCKETS_MS: [u64; 7] = [50, 100, 250, 500, 1000, 2000, 5000];

#[derive(Default)]
pub struct DeliveryMetrics {
    attempts: AtomicU64,
    delivered: AtomicU64,
    dead: AtomicU64,
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub delivered: u64,
    pub dead: u64,
    /// (bucket upper bound in ms, cumulative count); `None` bound is +inf.
    pub latency_buckets: Vec<(Option<u64>, u64)>,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One completed HTTP exchange, whatever its status.
    pub fn observe_attempt(&self, elapsed: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let ms = elapsed.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        metrics::histogram!("relay_delivery_latency_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("relay_delivery_attempts_total").increment(1);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_events_delivered_total").increment(1);
    }

    pub fn record_dead(&self) {
        self.dead.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_events_dead_total").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency_buckets = LATENCY_BUCKETS_MS
            .iter()
            .map(|&b| Some(b))
            .chain(std::iter::once(None))
            .zip(self.buckets.iter())
            .map(|(bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
            latency_buckets,
        }
    }
}

/// Periodically report backlog depth and delivery totals until shutdown.
pub fn spawn_metrics_reporter(
    outbox: Arc<dyn OutboxStore>,
    delivery_metrics: Arc<DeliveryMetrics>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match outbox.pending_stats().await {
                        Ok(stats) => {
                            let oldest_age_s = stats
                                .oldest_created_at
                                .map(|t| (Utc::now() - t).num_seconds().max(0))
                                .unwrap_or(0);
                            metrics::gauge!("relay_outbox_pending").set(stats.pending as f64);
                            metrics::gauge!("relay_outbox_oldest_pending_age_seconds")
                                .set(oldest_age_s as f64);

                            let snapshot = delivery_metrics.snapshot();
                            info!(
                                pending = stats.pending,
                                oldest_age_s,
                                attempts_total = snapshot.attempts,
                                delivered_total = snapshot.delivered,
                                dead_total = snapshot.dead,
                                "outbox delivery metrics"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "metrics tick could not read pending stats");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("metrics reporter shutting down");
                    break;
                }
            }
        }
    })
}
