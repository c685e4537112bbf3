use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

// ============================================================================
// Outbox Event Types
// ============================================================================

/// Lifecycle state of an outbox row.
///
/// Rows only move pending -> leased -> {delivered | pending (retry) | dead}.
/// `lease_until` is set while a row is leased; an expired lease makes the
/// row reclaimable by the next claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Leased,
    Delivered,
    Dead,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Leased => "leased",
            EventStatus::Delivered => "delivered",
            EventStatus::Dead => "dead",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "leased" => Ok(EventStatus::Leased),
            "delivered" => Ok(EventStatus::Delivered),
            "dead" => Ok(EventStatus::Dead),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// A durable business event awaiting webhook delivery.
///
/// Producers insert these rows alongside their business writes; the
/// delivery worker only mutates status, lease, attempt, and error columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub org_id: String,
    pub topic: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub status: EventStatus,
    pub lease_until: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    /// Idempotency seed, stable across redeliveries of the same event.
    pub key: String,
    pub last_status_code: Option<i32>,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// The `Idempotency-Key` header value for this event. Falls back to a
    /// topic-qualified id when the producer left the key empty.
    pub fn idempotency_key(&self) -> String {
        if self.key.is_empty() {
            format!("{}:{}", self.topic, self.id)
        } else {
            self.key.clone()
        }
    }
}

// ============================================================================
// Subscription Types
// ============================================================================

/// A registered webhook endpoint. Created and updated by administrative
/// tooling; read-only to the delivery core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub org_id: String,
    pub endpoint_url: String,
    pub secret: String,
    pub topics: Vec<String>,
    pub is_active: bool,
    /// Cap on concurrent deliveries to this endpoint from one worker.
    pub max_in_flight: u32,
}

impl Subscription {
    pub fn matches_topic(&self, topic: &str) -> bool {
        self.is_active && self.topics.iter().any(|t| t == topic)
    }
}

// ============================================================================
// Delivery Attempt Types
// ============================================================================

/// Outcome of a single webhook POST, fed into the attempt record. Not
/// persisted as its own row.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempt_number: u32,
}

impl DeliveryOutcome {
    pub fn success(status_code: u16, attempt_number: u32) -> Self {
        Self {
            status_code: Some(status_code),
            error: None,
            attempt_number,
        }
    }

    pub fn failure(status_code: Option<u16>, error: String, attempt_number: u32) -> Self {
        Self {
            status_code,
            error: Some(error),
            attempt_number,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Leased,
            EventStatus::Delivered,
            EventStatus::Dead,
        ] {
            assert_eq!(EventStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(EventStatus::from_str("unknown").is_err());
    }

    #[test]
    fn test_topic_match_requires_active() {
        let mut sub = Subscription {
            id: "sub-1".to_string(),
            org_id: "org-1".to_string(),
            endpoint_url: "https://hooks.example.com/in".to_string(),
            secret: "s3cret".to_string(),
            topics: vec!["order.created".to_string()],
            is_active: true,
            max_in_flight: 4,
        };

        assert!(sub.matches_topic("order.created"));
        assert!(!sub.matches_topic("order.cancelled"));

        sub.is_active = false;
        assert!(!sub.matches_topic("order.created"));
    }

    #[test]
    fn test_idempotency_key_fallback() {
        let mut event = OutboxEvent {
            id: "evt-1".to_string(),
            org_id: "org-1".to_string(),
            topic: "load.assigned".to_string(),
            aggregate_type: "load".to_string(),
            aggregate_id: "load-9".to_string(),
            payload: serde_json::json!({}),
            version: 1,
            created_at: Utc::now(),
            status: EventStatus::Pending,
            lease_until: None,
            next_attempt_at: None,
            attempts: 0,
            key: "producer-key".to_string(),
            last_status_code: None,
            last_error: None,
        };

        assert_eq!(event.idempotency_key(), "producer-key");

        event.key = String::new();
        assert_eq!(event.idempotency_key(), "load.assigned:evt-1");
    }
}
