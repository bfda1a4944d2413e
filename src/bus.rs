//! Message bus backends.
//!
//! A topic is an append-only log. Each consumer group keeps one offset per
//! topic; consumers sharing a group compete, so every message reaches one
//! consumer per group. There is no acknowledgement: a message is consumed
//! when claimed, and handlers rely on idempotence for retries.
//!
//! | Backend | Scope |
//! |---------|-------|
//! | [`InMemoryBus`] | one process; wakes waiting consumers on publish |
//! | [`SqliteBus`] | shared through the database; consumers poll |

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use llmops_core::models::{new_id, now_ts};

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub published_at: i64,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a message. Returns its ID.
    async fn publish(&self, topic: &str, payload: Value) -> Result<String>;

    /// Claim the group's next message without waiting.
    async fn try_receive(&self, topic: &str, group: &str) -> Result<Option<BusMessage>>;

    /// Wait for the group's next message. `None` once `cancel` fires.
    async fn receive(
        &self,
        topic: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<BusMessage>>;
}

// ═══════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct TopicLog {
    messages: Vec<BusMessage>,
    offsets: HashMap<String, usize>,
}

#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, topic: &str, group: &str) -> Result<Option<BusMessage>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| anyhow!("bus mutex poisoned"))?;
        let Some(log) = topics.get_mut(topic) else {
            return Ok(None);
        };
        let offset = log.offsets.entry(group.to_string()).or_insert(0);
        match log.messages.get(*offset) {
            Some(message) => {
                *offset += 1;
                Ok(Some(message.clone()))
            }
            None => Ok(None),
        }
    }

    /// Messages published to `topic` so far.
    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|t| t.get(topic).map_or(0, |log| log.messages.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<String> {
        let message = BusMessage {
            id: new_id(),
            topic: topic.to_string(),
            payload,
            published_at: now_ts(),
        };
        let id = message.id.clone();
        {
            let mut topics = self
                .topics
                .lock()
                .map_err(|_| anyhow!("bus mutex poisoned"))?;
            topics
                .entry(topic.to_string())
                .or_default()
                .messages
                .push(message);
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn try_receive(&self, topic: &str, group: &str) -> Result<Option<BusMessage>> {
        self.claim(topic, group)
    }

    async fn receive(
        &self,
        topic: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<BusMessage>> {
        loop {
            // Register for wakeups before checking so a publish in between
            // is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.claim(topic, group)? {
                return Ok(Some(message));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════════

/// Durable bus over the `bus_messages` / `bus_offsets` tables.
pub struct SqliteBus {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqliteBus {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl MessageBus for SqliteBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<String> {
        let id = new_id();
        sqlx::query(
            r#"
            INSERT INTO bus_messages (id, topic, payload_json, published_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(topic)
        .bind(serde_json::to_string(&payload)?)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn try_receive(&self, topic: &str, group: &str) -> Result<Option<BusMessage>> {
        sqlx::query(
            "INSERT OR IGNORE INTO bus_offsets (topic, group_name, last_seq) VALUES (?, ?, 0)",
        )
        .bind(topic)
        .bind(group)
        .execute(&self.pool)
        .await?;

        // A single statement advances the offset, so competing consumers
        // never claim the same message.
        let claimed = sqlx::query(
            r#"
            UPDATE bus_offsets
            SET last_seq = (
                SELECT MIN(seq) FROM bus_messages
                WHERE topic = bus_offsets.topic AND seq > bus_offsets.last_seq
            )
            WHERE topic = ? AND group_name = ?
              AND EXISTS (
                SELECT 1 FROM bus_messages
                WHERE topic = bus_offsets.topic AND seq > bus_offsets.last_seq
              )
            RETURNING last_seq
            "#,
        )
        .bind(topic)
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = claimed else {
            return Ok(None);
        };
        let seq: i64 = row.get("last_seq");

        let row = sqlx::query(
            "SELECT id, topic, payload_json, published_at FROM bus_messages WHERE seq = ?",
        )
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;
        let payload: String = row.get("payload_json");
        Ok(Some(BusMessage {
            id: row.get("id"),
            topic: row.get("topic"),
            payload: serde_json::from_str(&payload)?,
            published_at: row.get("published_at"),
        }))
    }

    async fn receive(
        &self,
        topic: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<BusMessage>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(message) = self.try_receive(topic, group).await? {
                return Ok(Some(message));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }
}
