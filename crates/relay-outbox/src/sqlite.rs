use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::{EventStatus, OutboxEvent, Subscription};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::store::{OutboxStore, PendingStats, SubscriptionStore};

const EVENT_COLUMNS: &str = "id, org_id, topic, aggregate_type, aggregate_id, payload, version, \
     idempotency_key, status, attempts, lease_until, next_attempt_at, last_status_code, \
     last_error, created_at";

pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                idempotency_key TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                lease_until BIGINT,
                next_attempt_at BIGINT,
                last_status_code INTEGER,
                last_error TEXT,
                created_at BIGINT NOT NULL,
                delivered_at BIGINT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_events_due
                ON outbox_events(status, next_attempt_at, created_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                endpoint_url TEXT NOT NULL,
                secret TEXT NOT NULL,
                topics TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                max_in_flight INTEGER NOT NULL DEFAULT 4
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_subscriptions_org
                ON webhook_subscriptions(org_id, is_active)
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Producer-side insert, also used to seed tests.
    pub async fn insert_event(&self, event: &OutboxEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, org_id, topic, aggregate_type, aggregate_id, payload, version,
                 idempotency_key, status, attempts, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.org_id)
        .bind(&event.topic)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(event.version)
        .bind(&event.key)
        .bind(event.status.as_str())
        .bind(event.attempts)
        .bind(event.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions
                (id, org_id, endpoint_url, secret, topics, is_active, max_in_flight)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&subscription.id)
        .bind(&subscription.org_id)
        .bind(&subscription.endpoint_url)
        .bind(&subscription.secret)
        .bind(serde_json::to_string(&subscription.topics)?)
        .bind(subscription.is_active)
        .bind(subscription.max_in_flight as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_event(&self, id: &str) -> Result<Option<OutboxEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM outbox_events WHERE id = ?",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| event_from_row(&r)).transpose()
    }
}

fn event_from_row(row: &SqliteRow) -> Result<OutboxEvent> {
    let created_at = DateTime::from_timestamp_millis(row.get("created_at"))
        .ok_or_else(|| anyhow::anyhow!("invalid created_at timestamp"))?;
    let status: String = row.get("status");
    let status: EventStatus = status
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    Ok(OutboxEvent {
        id: row.get("id"),
        org_id: row.get("org_id"),
        topic: row.get("topic"),
        aggregate_type: row.get("aggregate_type"),
        aggregate_id: row.get("aggregate_id"),
        payload: serde_json::from_str(row.get("payload"))?,
        version: row.get("version"),
        created_at,
        status,
        lease_until: row
            .get::<Option<i64>, _>("lease_until")
            .and_then(DateTime::from_timestamp_millis),
        next_attempt_at: row
            .get::<Option<i64>, _>("next_attempt_at")
            .and_then(DateTime::from_timestamp_millis),
        attempts: row.get("attempts"),
        key: row.get("idempotency_key"),
        last_status_code: row.get("last_status_code"),
        last_error: row.get("last_error"),
    })
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<OutboxEvent>> {
        let now = Utc::now().timestamp_millis();
        let lease_until = now + lease.as_millis() as i64;

        // SQLite serializes writers, which makes this single statement the
        // atomic claim: rows move to leased before any other worker can see
        // them as due.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox_events
            SET status = 'leased', lease_until = ?
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE (status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?))
                   OR (status = 'leased' AND lease_until <= ?)
                ORDER BY created_at
                LIMIT ?
            )
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(lease_until)
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(event_from_row(row)?);
        }
        if !events.is_empty() {
            debug!(claimed = events.len(), "claimed outbox batch");
        }
        Ok(events)
    }

    async fn record_attempt(
        &self,
        id: &str,
        status_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<i32> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1, last_status_code = ?, last_error = ?
            WHERE id = ?
            RETURNING attempts
            "#,
        )
        .bind(status_code.map(|c| c as i32))
        .bind(error)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("attempts"))
    }

    async fn schedule_retry(&self, id: &str, retry_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', next_attempt_at = ?, lease_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(retry_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'delivered', lease_until = NULL, delivered_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: &str,
        status_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'dead', lease_until = NULL,
                last_status_code = COALESCE(?, last_status_code),
                last_error = COALESCE(?, last_error)
            WHERE id = ?
            "#,
        )
        .bind(status_code.map(|c| c as i32))
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_stats(&self) -> Result<PendingStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS pending, MIN(created_at) AS oldest FROM outbox_events WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PendingStats {
            pending: row.get("pending"),
            oldest_created_at: row
                .get::<Option<i64>, _>("oldest")
                .and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[async_trait]
impl SubscriptionStore for SqliteOutboxStore {
    async fn active_for(&self, org_id: &str, topic: &str) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            r#"
            SELECT id, org_id, endpoint_url, secret, topics, is_active, max_in_flight
            FROM webhook_subscriptions
            WHERE org_id = ? AND is_active = 1
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let mut subscriptions = Vec::new();
        for row in rows {
            let subscription = Subscription {
                id: row.get("id"),
                org_id: row.get("org_id"),
                endpoint_url: row.get("endpoint_url"),
                secret: row.get("secret"),
                topics: serde_json::from_str(row.get("topics"))?,
                is_active: row.get("is_active"),
                max_in_flight: row.get::<i64, _>("max_in_flight") as u32,
            };
            // Topic membership is checked in memory; the topics column is an
            // opaque JSON array to the database.
            if subscription.matches_topic(topic) {
                subscriptions.push(subscription);
            }
        }
        Ok(subscriptions)
    }
}
