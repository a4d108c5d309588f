// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use moray_config::QueueConfig;
use moray_store::{now_ms, rusqlite::params, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::worker::OutboundAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Dispatching,
    Sent,
    Failed,
    DeadLetter,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatching => "dispatching",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "dispatching" => Some(Self::Dispatching),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// Worker behavior knob, mutated by the incident manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Normal,
    /// Halved batch size per cycle.
    Throttled,
    /// No new dispatches; in-flight attempts complete.
    Drain,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueControls {
    pub mode: QueueMode,
    /// Scales the computed retry backoff.
    pub retry_window_multiplier: f64,
}

impl Default for QueueControls {
    fn default() -> Self {
        Self {
            mode: QueueMode::Normal,
            retry_window_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub id: String,
    pub platform: String,
    pub chat_id: String,
    pub payload: String,
    pub state: DeliveryState,
    pub attempts: u32,
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

/// Live table counts plus run totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub dispatching: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_letter: u64,
    pub total_sent: u64,
    /// Deliveries that reached the dead-letter state this run.
    pub total_failed: u64,
}

#[derive(Default)]
struct Totals {
    sent: u64,
    failed: u64,
}

pub struct DeliveryQueue {
    store: Store,
    cfg: QueueConfig,
    controls: Mutex<QueueControls>,
    totals: Mutex<Totals>,
}

impl DeliveryQueue {
    pub fn new(store: Store, cfg: QueueConfig) -> Self {
        Self {
            store,
            cfg,
            controls: Mutex::new(QueueControls::default()),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub async fn enqueue(
        &self,
        platform: &str,
        chat_id: &str,
        payload: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let row_id = id.clone();
        let platform = platform.to_string();
        let chat_id = chat_id.to_string();
        let payload = payload.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO delivery_queue
                     (id, platform, chat_id, payload, state, attempts, next_attempt_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'queued', 0, NULL, ?5)",
                    params![row_id, platform, chat_id, payload, now_ms()],
                )?;
                Ok(())
            })
            .await?;
        debug!(delivery = %id, "enqueued outbound delivery");
        Ok(id)
    }

    pub fn controls(&self) -> QueueControls {
        *self.controls.lock().unwrap()
    }

    pub fn set_mode(&self, mode: QueueMode) {
        let mut controls = self.controls.lock().unwrap();
        if controls.mode != mode {
            info!(from = ?controls.mode, to = ?mode, "delivery queue mode change");
            controls.mode = mode;
        }
    }

    pub fn set_retry_window_multiplier(&self, multiplier: f64) {
        self.controls.lock().unwrap().retry_window_multiplier = multiplier.max(0.1);
    }

    /// One polling cycle: claim due rows, dispatch each through `adapter`,
    /// settle outcomes.  Returns how many deliveries were dispatched.
    pub async fn process_due(&self, adapter: &dyn OutboundAdapter) -> Result<usize> {
        let controls = self.controls();
        if controls.mode == QueueMode::Drain {
            return Ok(0);
        }
        let batch = match controls.mode {
            QueueMode::Throttled => (self.cfg.batch_size / 2).max(1),
            _ => self.cfg.batch_size,
        };

        let claimed = self.claim_batch(batch).await?;
        let count = claimed.len();
        for record in claimed {
            self.dispatch_one(adapter, record, controls.retry_window_multiplier)
                .await?;
        }
        Ok(count)
    }

    /// The at-most-once claim: select due rows and mark them `dispatching`
    /// with the attempt counter bumped, all in one transaction.
    async fn claim_batch(&self, batch: usize) -> Result<Vec<DeliveryRecord>> {
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let now = now_ms();
                let mut claimed = {
                    let mut stmt = tx.prepare(
                        "SELECT id, platform, chat_id, payload, state, attempts,
                                next_attempt_at, created_at, resolved_at
                         FROM delivery_queue
                         WHERE state IN ('queued', 'failed')
                           AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                         ORDER BY next_attempt_at ASC, created_at ASC, rowid ASC
                         LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![now, batch as i64], |r| {
                            Ok(DeliveryRecord {
                                id: r.get(0)?,
                                platform: r.get(1)?,
                                chat_id: r.get(2)?,
                                payload: r.get(3)?,
                                state: DeliveryState::parse(&r.get::<_, String>(4)?)
                                    .unwrap_or(DeliveryState::Queued),
                                attempts: r.get::<_, i64>(5)? as u32,
                                next_attempt_at: r.get(6)?,
                                created_at: r.get(7)?,
                                resolved_at: r.get(8)?,
                            })
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                for record in &mut claimed {
                    record.attempts += 1;
                    record.state = DeliveryState::Dispatching;
                    tx.execute(
                        "UPDATE delivery_queue
                         SET state = 'dispatching', attempts = ?1
                         WHERE id = ?2",
                        params![record.attempts as i64, record.id],
                    )?;
                }
                tx.commit()?;
                Ok(claimed)
            })
            .await
    }

    async fn dispatch_one(
        &self,
        adapter: &dyn OutboundAdapter,
        record: DeliveryRecord,
        retry_window_multiplier: f64,
    ) -> Result<()> {
        let attempt_number = record.attempts;
        let started_at = now_ms();
        let delivery_id = record.id.clone();
        {
            let id = delivery_id.clone();
            self.store
                .with_conn(move |conn| {
                    conn.execute(
                        "INSERT INTO delivery_attempts
                         (delivery_id, attempt_number, started_at)
                         VALUES (?1, ?2, ?3)",
                        params![id, attempt_number as i64, started_at],
                    )?;
                    Ok(())
                })
                .await?;
        }

        let clock = Instant::now();
        let outcome = adapter
            .deliver(&record.platform, &record.chat_id, &record.payload)
            .await;
        let duration_ms = clock.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                let id = delivery_id.clone();
                self.store
                    .with_conn(move |conn| {
                        let tx = conn.transaction()?;
                        tx.execute(
                            "UPDATE delivery_attempts
                             SET completed_at = ?1, duration_ms = ?2
                             WHERE delivery_id = ?3 AND attempt_number = ?4",
                            params![now_ms(), duration_ms, id, attempt_number as i64],
                        )?;
                        tx.execute(
                            "UPDATE delivery_queue
                             SET state = 'sent', resolved_at = ?1, next_attempt_at = NULL
                             WHERE id = ?2",
                            params![now_ms(), id],
                        )?;
                        tx.commit()?;
                        Ok(())
                    })
                    .await?;
                self.totals.lock().unwrap().sent += 1;
                debug!(delivery = %delivery_id, attempt = attempt_number, "delivery sent");
            }
            Err(e) => {
                let error = sanitize(&e.to_string());
                let dead = attempt_number >= self.cfg.max_attempts;
                let backoff_ms = (self.cfg.base_backoff_ms as f64
                    * 2f64.powi(attempt_number.saturating_sub(1) as i32)
                    * retry_window_multiplier) as i64;
                let next_attempt_at = now_ms() + backoff_ms;
                let id = delivery_id.clone();
                let err = error.clone();
                self.store
                    .with_conn(move |conn| {
                        let tx = conn.transaction()?;
                        tx.execute(
                            "UPDATE delivery_attempts
                             SET completed_at = ?1, duration_ms = ?2, error = ?3
                             WHERE delivery_id = ?4 AND attempt_number = ?5",
                            params![now_ms(), duration_ms, err, id, attempt_number as i64],
                        )?;
                        if dead {
                            tx.execute(
                                "UPDATE delivery_queue
                                 SET state = 'dead_letter', resolved_at = ?1, next_attempt_at = NULL
                                 WHERE id = ?2",
                                params![now_ms(), id],
                            )?;
                        } else {
                            tx.execute(
                                "UPDATE delivery_queue
                                 SET state = 'failed', next_attempt_at = ?1
                                 WHERE id = ?2",
                                params![next_attempt_at, id],
                            )?;
                        }
                        tx.commit()?;
                        Ok(())
                    })
                    .await?;
                if dead {
                    self.totals.lock().unwrap().failed += 1;
                    warn!(delivery = %delivery_id, attempts = attempt_number, error = %error,
                          "delivery dead-lettered");
                } else {
                    debug!(delivery = %delivery_id, attempt = attempt_number, error = %error,
                           backoff_ms, "delivery failed; retry scheduled");
                }
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeliveryRecord>> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT id, platform, chat_id, payload, state, attempts,
                                next_attempt_at, created_at, resolved_at
                         FROM delivery_queue WHERE id = ?1",
                        params![id],
                        |r| {
                            Ok(DeliveryRecord {
                                id: r.get(0)?,
                                platform: r.get(1)?,
                                chat_id: r.get(2)?,
                                payload: r.get(3)?,
                                state: DeliveryState::parse(&r.get::<_, String>(4)?)
                                    .unwrap_or(DeliveryState::Queued),
                                attempts: r.get::<_, i64>(5)? as u32,
                                next_attempt_at: r.get(6)?,
                                created_at: r.get(7)?,
                                resolved_at: r.get(8)?,
                            })
                        },
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        moray_store::rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(record)
            })
            .await
    }

    /// Attempt ledger rows for one delivery: `(attempt_number, error)`.
    pub async fn attempts(&self, delivery_id: &str) -> Result<Vec<(u32, Option<String>)>> {
        let id = delivery_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT attempt_number, error FROM delivery_attempts
                     WHERE delivery_id = ?1 ORDER BY attempt_number ASC",
                )?;
                let rows = stmt
                    .query_map(params![id], |r| {
                        Ok((r.get::<_, i64>(0)? as u32, r.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = self
            .store
            .with_conn(|conn| {
                let mut stats = QueueStats::default();
                let mut stmt = conn
                    .prepare("SELECT state, COUNT(*) FROM delivery_queue GROUP BY state")?;
                let rows = stmt
                    .query_map([], |r| {
                        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                for (state, count) in rows {
                    match DeliveryState::parse(&state) {
                        Some(DeliveryState::Queued) => stats.queued = count,
                        Some(DeliveryState::Dispatching) => stats.dispatching = count,
                        Some(DeliveryState::Sent) => stats.sent = count,
                        Some(DeliveryState::Failed) => stats.failed = count,
                        Some(DeliveryState::DeadLetter) => stats.dead_letter = count,
                        None => {}
                    }
                }
                Ok(stats)
            })
            .await?;
        let totals = self.totals.lock().unwrap();
        stats.total_sent = totals.sent;
        stats.total_failed = totals.failed;
        Ok(stats)
    }

    pub(crate) fn poll_interval_ms(&self) -> u64 {
        self.cfg.poll_interval_ms
    }
}

fn sanitize(message: &str) -> String {
    message
        .split_whitespace()
        .map(|tok| {
            if tok.starts_with("sk-") || tok.starts_with("Bearer") {
                "[redacted]"
            } else {
                tok
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyAdapter {
        /// Succeed from this call number on (1-based); 0 = always fail.
        succeed_from: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OutboundAdapter for FlakyAdapter {
        async fn deliver(&self, _platform: &str, _chat_id: &str, _payload: &str) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_from != 0 && n >= self.succeed_from {
                Ok(())
            } else {
                anyhow::bail!("adapter refused (call {n})")
            }
        }
    }

    async fn queue(cfg: QueueConfig) -> (tempfile::TempDir, DeliveryQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("queue.db")).await.unwrap();
        (dir, DeliveryQueue::new(store, cfg))
    }

    fn instant_retry_cfg(max_attempts: u32) -> QueueConfig {
        QueueConfig {
            max_attempts,
            base_backoff_ms: 0,
            poll_interval_ms: 1,
            batch_size: 8,
        }
    }

    #[tokio::test]
    async fn success_cycle_updates_record_attempt_and_metrics() {
        let (_d, q) = queue(instant_retry_cfg(3)).await;
        let adapter = FlakyAdapter {
            succeed_from: 1,
            calls: AtomicUsize::new(0),
        };
        let id = q.enqueue("telegram", "chat-1", "hello").await.unwrap();
        let dispatched = q.process_due(&adapter).await.unwrap();
        assert_eq!(dispatched, 1);

        let record = q.get(&id).await.unwrap().unwrap();
        assert_eq!(record.state, DeliveryState::Sent);
        assert_eq!(record.attempts, 1);
        assert!(record.resolved_at.is_some());

        let attempts = q.attempts(&id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].0, 1);
        assert!(attempts[0].1.is_none());

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.total_sent, 1);
        assert_eq!(stats.sent, 1);
    }

    #[tokio::test]
    async fn dead_letter_after_max_attempts_with_dense_ledger() {
        let (_d, q) = queue(instant_retry_cfg(3)).await;
        let adapter = FlakyAdapter {
            succeed_from: 0,
            calls: AtomicUsize::new(0),
        };
        let id = q.enqueue("telegram", "chat-1", "doomed").await.unwrap();
        // Four polling cycles; only three may dispatch.
        for _ in 0..4 {
            q.process_due(&adapter).await.unwrap();
        }
        let record = q.get(&id).await.unwrap().unwrap();
        assert_eq!(record.state, DeliveryState::DeadLetter);
        assert_eq!(record.attempts, 3);

        let attempts = q.attempts(&id).await.unwrap();
        assert_eq!(
            attempts.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 2, 3],
            "attempt numbers must be dense 1..3"
        );
        assert!(attempts.iter().all(|(_, e)| e.is_some()));

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_delivery_waits_for_backoff() {
        let cfg = QueueConfig {
            max_attempts: 3,
            base_backoff_ms: 60_000,
            poll_interval_ms: 1,
            batch_size: 8,
        };
        let (_d, q) = queue(cfg).await;
        let adapter = FlakyAdapter {
            succeed_from: 0,
            calls: AtomicUsize::new(0),
        };
        let id = q.enqueue("telegram", "c", "x").await.unwrap();
        q.process_due(&adapter).await.unwrap();
        // Second cycle: the row's next_attempt_at is a minute away.
        let dispatched = q.process_due(&adapter).await.unwrap();
        assert_eq!(dispatched, 0);
        let record = q.get(&id).await.unwrap().unwrap();
        assert_eq!(record.state, DeliveryState::Failed);
        assert!(record.next_attempt_at.unwrap() > now_ms() + 30_000);
    }

    #[tokio::test]
    async fn fifo_order_within_a_batch() {
        let (_d, q) = queue(instant_retry_cfg(3)).await;
        let a = q.enqueue("p", "c", "first").await.unwrap();
        let b = q.enqueue("p", "c", "second").await.unwrap();
        let claimed = q.claim_batch(8).await.unwrap();
        assert_eq!(
            claimed.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec![a.as_str(), b.as_str()]
        );
    }

    #[tokio::test]
    async fn claim_is_at_most_once_per_cycle() {
        let (_d, q) = queue(instant_retry_cfg(3)).await;
        q.enqueue("p", "c", "x").await.unwrap();
        let first = q.claim_batch(8).await.unwrap();
        let second = q.claim_batch(8).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "a dispatching row must not be re-claimed");
    }

    #[tokio::test]
    async fn drain_mode_stops_new_dispatches() {
        let (_d, q) = queue(instant_retry_cfg(3)).await;
        let adapter = FlakyAdapter {
            succeed_from: 1,
            calls: AtomicUsize::new(0),
        };
        q.enqueue("p", "c", "x").await.unwrap();
        q.set_mode(QueueMode::Drain);
        assert_eq!(q.process_due(&adapter).await.unwrap(), 0);
        q.set_mode(QueueMode::Normal);
        assert_eq!(q.process_due(&adapter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn throttled_mode_halves_the_batch() {
        let (_d, q) = queue(QueueConfig {
            batch_size: 4,
            ..instant_retry_cfg(3)
        })
        .await;
        let adapter = FlakyAdapter {
            succeed_from: 1,
            calls: AtomicUsize::new(0),
        };
        for i in 0..4 {
            q.enqueue("p", "c", &format!("m{i}")).await.unwrap();
        }
        q.set_mode(QueueMode::Throttled);
        assert_eq!(q.process_due(&adapter).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn retry_window_multiplier_scales_backoff() {
        let cfg = QueueConfig {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            poll_interval_ms: 1,
            batch_size: 8,
        };
        let (_d, q) = queue(cfg).await;
        q.set_retry_window_multiplier(10.0);
        let adapter = FlakyAdapter {
            succeed_from: 0,
            calls: AtomicUsize::new(0),
        };
        let id = q.enqueue("p", "c", "x").await.unwrap();
        q.process_due(&adapter).await.unwrap();
        let record = q.get(&id).await.unwrap().unwrap();
        // 1000ms * 2^0 * 10 = 10s out.
        assert!(record.next_attempt_at.unwrap() >= now_ms() + 8_000);
    }

    #[tokio::test]
    async fn adapter_errors_are_sanitized_in_ledger() {
        struct LeakyAdapter;
        #[async_trait]
        impl OutboundAdapter for LeakyAdapter {
            async fn deliver(&self, _p: &str, _c: &str, _m: &str) -> Result<()> {
                anyhow::bail!("post failed with sk-verysecret token")
            }
        }
        let (_d, q) = queue(instant_retry_cfg(1)).await;
        let id = q.enqueue("p", "c", "x").await.unwrap();
        q.process_due(&LeakyAdapter).await.unwrap();
        let attempts = q.attempts(&id).await.unwrap();
        let error = attempts[0].1.as_deref().unwrap();
        assert!(!error.contains("sk-verysecret"));
    }
}
