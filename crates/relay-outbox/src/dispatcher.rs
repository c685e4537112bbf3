//! Signed webhook dispatch
//!
//! Builds the canonical delivery payload, signs it, and POSTs it to a
//! subscriber endpoint. Classification of the response into a delivery
//! decision lives here too, so the worker's control flow stays free of
//! status-code arithmetic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use relay_common::{OutboxEvent, Subscription};
use serde::Serialize;
use tracing::debug;

use crate::signer;

/// Ceiling on an honored `Retry-After`, in seconds.
const RETRY_AFTER_MAX_SECS: u64 = 3600;
/// Fallback delay for a 429 without a usable `Retry-After`.
const RETRY_AFTER_DEFAULT_SECS: u64 = 60;
/// Exponent cap for the generic backoff curve.
const BACKOFF_MAX_EXPONENT: i32 = 8;
/// Ceiling on a generic backoff delay, in seconds.
const BACKOFF_MAX_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct WebhookDispatcherConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for WebhookDispatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// The HTTP exchange completed; the status says nothing yet about retry
/// semantics.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, seconds.
    pub retry_after: Option<u64>,
}

/// The exchange never produced a status line.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// What the worker should do after one webhook attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDisposition {
    /// 2xx: this subscriber is done.
    Delivered,
    /// 429: retry after the destination's requested delay.
    RetryAfter { delay: Duration },
    /// 5xx or transport failure: retry on the generic backoff curve.
    RetryBackoff,
    /// Any other status: the destination rejected the request; retrying
    /// cannot self-heal.
    Dead,
}

pub fn classify_status(status: u16, retry_after: Option<u64>) -> AttemptDisposition {
    match status {
        200..=299 => AttemptDisposition::Delivered,
        429 => {
            let secs = retry_after
                .map(|s| s.min(RETRY_AFTER_MAX_SECS))
                .unwrap_or(RETRY_AFTER_DEFAULT_SECS);
            AttemptDisposition::RetryAfter {
                delay: Duration::from_secs(secs),
            }
        }
        500..=599 => AttemptDisposition::RetryBackoff,
        _ => AttemptDisposition::Dead,
    }
}

/// Generic transient-failure backoff: `2^min(8, attempts)` seconds plus
/// 0-10s of jitter, capped at five minutes.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exponent = attempts.clamp(0, BACKOFF_MAX_EXPONENT) as u32;
    let base = 1u64 << exponent;
    let jitter = rand::thread_rng().gen_range(0..10);
    Duration::from_secs((base + jitter).min(BACKOFF_MAX_SECS))
}

/// Canonical wire payload. Field order is part of the signed contract.
#[derive(Serialize)]
struct DeliveryPayload<'a> {
    id: &'a str,
    topic: &'a str,
    version: i32,
    aggregate_type: &'a str,
    aggregate_id: &'a str,
    payload: &'a serde_json::Value,
    created_at: &'a DateTime<Utc>,
}

pub fn canonical_body(event: &OutboxEvent) -> anyhow::Result<String> {
    let payload = DeliveryPayload {
        id: &event.id,
        topic: &event.topic,
        version: event.version,
        aggregate_type: &event.aggregate_type,
        aggregate_id: &event.aggregate_id,
        payload: &event.payload,
        created_at: &event.created_at,
    };
    Ok(serde_json::to_string(&payload)?)
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookDispatcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// POST the pre-built body to the subscriber, signed with its secret.
    pub async fn send(
        &self,
        subscription: &Subscription,
        event: &OutboxEvent,
        body: &str,
    ) -> Result<WebhookResponse, DispatchError> {
        let timestamp = Utc::now().timestamp();
        let signature = signer::sign(&subscription.secret, timestamp, body);

        debug!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            endpoint = %subscription.endpoint_url,
            "dispatching webhook"
        );

        let response = self
            .client
            .post(&subscription.endpoint_url)
            .header("Content-Type", "application/json")
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .header("Idempotency-Key", event.idempotency_key())
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());

        Ok(WebhookResponse {
            status,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success_range() {
        assert_eq!(classify_status(200, None), AttemptDisposition::Delivered);
        assert_eq!(classify_status(204, None), AttemptDisposition::Delivered);
    }

    #[test]
    fn test_classify_429_honors_retry_after() {
        assert_eq!(
            classify_status(429, Some(120)),
            AttemptDisposition::RetryAfter {
                delay: Duration::from_secs(120)
            }
        );
        // Clamped to an hour, defaulted to a minute.
        assert_eq!(
            classify_status(429, Some(86_400)),
            AttemptDisposition::RetryAfter {
                delay: Duration::from_secs(3600)
            }
        );
        assert_eq!(
            classify_status(429, None),
            AttemptDisposition::RetryAfter {
                delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_classify_server_errors_retry() {
        for status in [500, 502, 503, 504] {
            assert_eq!(classify_status(status, None), AttemptDisposition::RetryBackoff);
        }
    }

    #[test]
    fn test_classify_client_errors_are_dead() {
        for status in [400, 401, 403, 404, 410, 422] {
            assert_eq!(classify_status(status, None), AttemptDisposition::Dead);
        }
    }

    #[test]
    fn test_retry_backoff_bounds() {
        for attempts in 0..=12 {
            let d = retry_backoff(attempts).as_secs();
            let base = 1u64 << attempts.clamp(0, 8) as u32;
            assert!(d >= base.min(300), "attempt {}: {} below floor", attempts, d);
            assert!(d <= (base + 9).min(300), "attempt {}: {} above ceiling", attempts, d);
        }
    }

    #[test]
    fn test_canonical_body_shape() {
        let event = OutboxEvent {
            id: "evt-1".to_string(),
            org_id: "org-1".to_string(),
            topic: "order.created".to_string(),
            aggregate_type: "order".to_string(),
            aggregate_id: "order-7".to_string(),
            payload: serde_json::json!({"total": 120}),
            version: 2,
            created_at: Utc::now(),
            status: relay_common::EventStatus::Pending,
            lease_until: None,
            next_attempt_at: None,
            attempts: 0,
            key: "k-1".to_string(),
            last_status_code: None,
            last_error: None,
        };

        let body = canonical_body(&event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed["id"], "evt-1");
        assert_eq!(parsed["topic"], "order.created");
        assert_eq!(parsed["version"], 2);
        assert_eq!(parsed["aggregate_type"], "order");
        assert_eq!(parsed["aggregate_id"], "order-7");
        assert_eq!(parsed["payload"]["total"], 120);
        // Internal bookkeeping never leaks onto the wire.
        assert!(parsed.get("status").is_none());
        assert!(parsed.get("attempts").is_none());
    }
}
