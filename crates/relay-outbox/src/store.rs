use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::{OutboxEvent, Subscription};

/// Aggregate view of the pending backlog, for the metrics tick.
#[derive(Debug, Clone)]
pub struct PendingStats {
    pub pending: i64,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

/// Durable event store operations the delivery worker depends on.
///
/// Producers insert rows; the worker mutates only status, lease, attempt,
/// and error columns through these calls. Each call is a single atomic
/// statement on the store side: correctness under multiple concurrent
/// workers rests on that, not on in-process locking.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due rows and lease them for `lease`.
    ///
    /// Due rows are pending rows whose retry time has passed, plus leased
    /// rows whose lease expired (their worker is presumed crashed). This is
    /// the sole admission point: a row returned here is never concurrently
    /// returned to another caller while its lease holds.
    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<OutboxEvent>>;

    /// Record one delivery attempt's outcome. Increments and returns the
    /// event's attempt counter; the counter lives in the store so the
    /// attempt ceiling survives process restarts.
    async fn record_attempt(
        &self,
        id: &str,
        status_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<i32>;

    /// Return the event to pending with a retry due time. Clears the lease.
    async fn schedule_retry(&self, id: &str, retry_at: DateTime<Utc>) -> Result<()>;

    async fn mark_delivered(&self, id: &str) -> Result<()>;

    async fn mark_dead(&self, id: &str, status_code: Option<u16>, error: Option<&str>)
        -> Result<()>;

    async fn pending_stats(&self) -> Result<PendingStats>;
}

/// Read-only view of the subscription registry. Subscriptions are managed
/// by administrative tooling outside this crate.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Active subscriptions for `org_id` whose topic set contains `topic`.
    async fn active_for(&self, org_id: &str, topic: &str) -> Result<Vec<Subscription>>;
}
