//! Durable webhook delivery on the outbox pattern
//!
//! Producers insert immutable event rows next to their business writes; the
//! delivery worker here polls the store, leases batches atomically, and
//! posts signed payloads to matching subscriptions until every event ends
//! delivered or dead. Process restarts and horizontal scaling are safe
//! because every guarantee lives in the store: the lease, the attempt
//! counter, and the retry schedule.

pub mod dispatcher;
pub mod metrics;
pub mod signer;
pub mod store;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use dispatcher::{
    canonical_body, classify_status, retry_backoff, AttemptDisposition, DispatchError,
    WebhookDispatcher, WebhookDispatcherConfig, WebhookResponse,
};
pub use metrics::{spawn_metrics_reporter, DeliveryMetrics, MetricsSnapshot};
pub use store::{OutboxStore, PendingStats, SubscriptionStore};
pub use worker::{DeliveryWorker, DeliveryWorkerConfig};
