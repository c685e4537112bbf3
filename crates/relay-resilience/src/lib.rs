//! Protective primitives for unreliable downstream dependencies
//!
//! This crate provides the in-process guards used around outbound calls:
//! - CircuitBreaker: rolling-window failure tracking with open/half-open recovery
//! - BreakerRegistry: one breaker per destination endpoint
//! - AdaptiveRateLimiter: per-destination windowed budgets with 429 backpressure
//! - RetryQueue: generic retries with exponential backoff and a dead letter queue
//!
//! All state is process-local and advisory. None of these primitives provide
//! delivery guarantees; durable guarantees live in the outbox layer.

pub mod breaker;
pub mod limiter;
pub mod retry_queue;

pub use breaker::{
    BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitState,
};
pub use limiter::{AdaptiveRateLimiter, RateLimiterConfig};
pub use retry_queue::{
    DlqItem, EnqueueOptions, Priority, RetryQueue, RetryQueueConfig, RetryTask, TaskHandler,
    TaskResult,
};
