//! Generic in-process retry queue with dead letter handling
//!
//! Schedules "operation + payload" tasks with bounded attempts, exponential
//! backoff with jitter, and priority ordering. Tasks that exhaust their
//! attempt budget move to the dead letter queue, which is the inspectable,
//! append-only record of permanently failed operations.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Dispatch order: high before normal before low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    pub priority: Priority,
    /// Initial delay before the first dispatch.
    pub delay: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            priority: Priority::Normal,
            delay: None,
        }
    }
}

/// A task handed to the consumer for one processing attempt.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub id: String,
    pub operation: String,
    pub payload: serde_json::Value,
    /// Failed attempts so far, zero on first dispatch.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub enum TaskResult {
    Success,
    Failure { error: String },
}

/// Consumer of queued tasks. One call per dispatch; the returned result is
/// the single success/failure signal for that attempt.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &RetryTask) -> TaskResult;
}

/// Terminal record of a permanently failed operation.
#[derive(Debug, Clone, Serialize)]
pub struct DlqItem {
    pub id: String,
    pub operation: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    pub tick_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct QueueItem {
    id: String,
    operation: String,
    payload: serde_json::Value,
    attempts: u32,
    max_attempts: u32,
    priority: Priority,
    next_retry_at: Instant,
    created_at: DateTime<Utc>,
    last_error: Option<String>,
}

#[derive(Default)]
struct QueueInner {
    items: Vec<QueueItem>,
    dlq: Vec<DlqItem>,
}

pub struct RetryQueue {
    config: RetryQueueConfig,
    inner: Mutex<QueueInner>,
}

impl RetryQueue {
    pub fn new(config: RetryQueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Add a task. Returns its queue id.
    pub fn enqueue(
        &self,
        operation: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let item = QueueItem {
            id: id.clone(),
            operation: operation.into(),
            payload,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            priority: options.priority,
            next_retry_at: Instant::now() + options.delay.unwrap_or(Duration::ZERO),
            created_at: Utc::now(),
            last_error: None,
        };
        self.inner.lock().items.push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Newest-first view of the dead letter queue.
    pub fn dlq_items(&self, limit: usize) -> Vec<DlqItem> {
        let inner = self.inner.lock();
        inner.dlq.iter().rev().take(limit).cloned().collect()
    }

    /// Drop all dead letter entries, returning how many were purged.
    pub fn purge_dlq(&self) -> usize {
        let mut inner = self.inner.lock();
        let purged = inner.dlq.len();
        inner.dlq.clear();
        purged
    }

    /// Consume due tasks on a fixed tick until shutdown.
    pub async fn run(&self, handler: &dyn TaskHandler, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once(handler).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("retry queue shutting down");
                    break;
                }
            }
        }
    }

    /// One scheduling pass: dispatch every due task, ordered by priority then
    /// due time.
    pub async fn run_once(&self, handler: &dyn TaskHandler) {
        let due: Vec<QueueItem> = {
            let mut inner = self.inner.lock();
            inner
                .items
                .sort_by(|a, b| a.priority.cmp(&b.priority).then(a.next_retry_at.cmp(&b.next_retry_at)));
            let now = Instant::now();
            inner
                .items
                .iter()
                .filter(|i| i.next_retry_at <= now)
                .cloned()
                .collect()
        };

        for item in due {
            let task = RetryTask {
                id: item.id.clone(),
                operation: item.operation.clone(),
                payload: item.payload.clone(),
                attempts: item.attempts,
            };

            match handler.handle(&task).await {
                TaskResult::Success => {
                    let mut inner = self.inner.lock();
                    inner.items.retain(|i| i.id != item.id);
                    debug!(task_id = %item.id, operation = %item.operation, "task completed");
                }
                TaskResult::Failure { error } => {
                    self.record_failure(&item.id, error);
                }
            }
        }
    }

    fn record_failure(&self, id: &str, error: String) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.items.iter().position(|i| i.id == id) else {
            return;
        };

        let item = &mut inner.items[pos];
        item.attempts += 1;
        item.last_error = Some(error);

        if item.attempts >= item.max_attempts {
            let item = inner.items.remove(pos);
            warn!(
                task_id = %item.id,
                operation = %item.operation,
                attempts = item.attempts,
                "task exhausted attempts, moving to DLQ"
            );
            inner.dlq.push(DlqItem {
                id: item.id,
                operation: item.operation,
                payload: item.payload,
                attempts: item.attempts,
                max_attempts: item.max_attempts,
                created_at: item.created_at,
                failed_at: Utc::now(),
                last_error: item.last_error,
                reason: "max attempts exceeded".to_string(),
            });
        } else {
            let delay = backoff_delay(&self.config, item.attempts);
            item.next_retry_at = Instant::now() + delay;
            debug!(
                task_id = %item.id,
                attempt = item.attempts,
                delay_ms = delay.as_millis() as u64,
                "task failed, retry scheduled"
            );
        }
    }
}

/// `min(max_delay, base * 2^attempts)` plus up to 30% jitter.
fn backoff_delay(config: &RetryQueueConfig, attempts: u32) -> Duration {
    let base = config.base_delay.as_millis() as u64;
    let max = config.max_delay.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempts.min(20)).min(max);
    let jitter = rand::thread_rng().gen_range(0..=exp * 3 / 10);
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RetryQueueConfig {
        RetryQueueConfig {
            tick_interval: Duration::from_millis(10),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl TaskHandler for AlwaysFail {
        async fn handle(&self, _task: &RetryTask) -> TaskResult {
            TaskResult::Failure {
                error: "downstream unavailable".to_string(),
            }
        }
    }

    struct AlwaysSucceed {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for AlwaysSucceed {
        async fn handle(&self, _task: &RetryTask) -> TaskResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            TaskResult::Success
        }
    }

    #[tokio::test]
    async fn test_success_removes_task() {
        let queue = RetryQueue::new(fast_config());
        let handler = AlwaysSucceed {
            calls: AtomicUsize::new(0),
        };

        queue.enqueue("sync-profile", serde_json::json!({"user": 7}), EnqueueOptions::default());
        queue.run_once(&handler).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        assert!(queue.dlq_items(10).is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_reach_dlq() {
        let queue = RetryQueue::new(fast_config());
        queue.enqueue(
            "send-invoice",
            serde_json::json!({"invoice": 42}),
            EnqueueOptions {
                max_attempts: 3,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            queue.run_once(&AlwaysFail).await;
            // Let the millisecond-scale backoff elapse before the next pass.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(queue.is_empty());
        let dlq = queue.dlq_items(10);
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].operation, "send-invoice");
        assert_eq!(dlq[0].attempts, 3);
        assert_eq!(dlq[0].reason, "max attempts exceeded");
        assert_eq!(
            dlq[0].last_error.as_deref(),
            Some("downstream unavailable")
        );
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = RetryQueue::new(fast_config());

        struct Recorder {
            seen: SyncMutex<Vec<String>>,
        }

        #[async_trait]
        impl TaskHandler for Recorder {
            async fn handle(&self, task: &RetryTask) -> TaskResult {
                self.seen.lock().push(task.operation.clone());
                TaskResult::Success
            }
        }

        for (op, priority) in [
            ("low-op", Priority::Low),
            ("normal-op", Priority::Normal),
            ("high-op", Priority::High),
        ] {
            queue.enqueue(
                op,
                serde_json::json!({}),
                EnqueueOptions {
                    priority,
                    ..Default::default()
                },
            );
        }

        let recorder = Recorder {
            seen: SyncMutex::new(Vec::new()),
        };
        queue.run_once(&recorder).await;

        assert_eq!(
            *recorder.seen.lock(),
            vec!["high-op".to_string(), "normal-op".to_string(), "low-op".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delayed_task_not_dispatched_early() {
        let queue = RetryQueue::new(fast_config());
        let handler = AlwaysSucceed {
            calls: AtomicUsize::new(0),
        };

        queue.enqueue(
            "later",
            serde_json::json!({}),
            EnqueueOptions {
                delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        queue.run_once(&handler).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_backoff_bounds_and_growth() {
        let config = RetryQueueConfig {
            tick_interval: Duration::from_secs(1),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(300),
        };

        for attempts in 1..=8 {
            let exp = 100u64 * (1 << attempts);
            for _ in 0..50 {
                let d = backoff_delay(&config, attempts).as_millis() as u64;
                assert!(d >= exp, "attempt {}: {} < {}", attempts, d, exp);
                assert!(d <= exp + exp * 3 / 10, "attempt {}: {} too large", attempts, d);
            }
        }

        // Successive delays are non-decreasing modulo jitter: the floor of
        // attempt n+1 exceeds the ceiling of attempt n until the cap.
        // At the cap every delay lands in [max, 1.3 * max].
        let capped = backoff_delay(&config, 30).as_millis() as u64;
        assert!((300_000..=390_000).contains(&capped));
    }
}
