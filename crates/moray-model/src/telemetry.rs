// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use moray_store::{now_ms, rusqlite::params, Store};
use serde::{Deserialize, Serialize};

/// Router state-transition event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingEventKind {
    Attempt,
    Success,
    Failure,
    RateLimit,
    CooldownSet,
    CooldownWait,
    CooldownSkip,
    Failover,
    ModeChange,
}

impl RoutingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempt => "attempt",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::RateLimit => "rate_limit",
            Self::CooldownSet => "cooldown_set",
            Self::CooldownWait => "cooldown_wait",
            Self::CooldownSkip => "cooldown_skip",
            Self::Failover => "failover",
            Self::ModeChange => "mode_change",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub kind: RoutingEventKind,
    pub provider_id: String,
    pub model_id: String,
    pub detail: Option<String>,
    pub created_at: i64,
}

/// Capped in-memory ring plus the persisted event table.
///
/// The ring drops oldest on overflow; the table keeps the newest
/// `max_persisted` rows, pruned on every insert.
pub(crate) struct Telemetry {
    ring: Mutex<VecDeque<RoutingEvent>>,
    ring_cap: usize,
    max_persisted: usize,
    store: Store,
}

impl Telemetry {
    pub(crate) fn new(store: Store, ring_cap: usize, max_persisted: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(ring_cap.min(1024))),
            ring_cap: ring_cap.max(1),
            max_persisted: max_persisted.max(1),
            store,
        }
    }

    pub(crate) async fn emit(
        &self,
        kind: RoutingEventKind,
        provider_id: &str,
        model_id: &str,
        detail: Option<String>,
    ) -> Result<()> {
        let event = RoutingEvent {
            kind,
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            detail,
            created_at: now_ms(),
        };
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == self.ring_cap {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        let keep = self.max_persisted as i64;
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO model_routing_events (provider_id, model_id, kind, detail, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.provider_id,
                        event.model_id,
                        event.kind.as_str(),
                        event.detail,
                        event.created_at,
                    ],
                )?;
                // Retain the newest rows only.
                conn.execute(
                    "DELETE FROM model_routing_events WHERE id NOT IN
                     (SELECT id FROM model_routing_events ORDER BY id DESC LIMIT ?1)",
                    params![keep],
                )?;
                Ok(())
            })
            .await
    }

    pub(crate) fn recent(&self) -> Vec<RoutingEvent> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn count(&self, kind: RoutingEventKind) -> usize {
        self.ring
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn telemetry(ring_cap: usize, persisted: usize) -> (tempfile::TempDir, Telemetry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).await.unwrap();
        (dir, Telemetry::new(store, ring_cap, persisted))
    }

    #[tokio::test]
    async fn ring_drops_oldest_on_overflow() {
        let (_d, t) = telemetry(3, 100).await;
        for i in 0..5 {
            t.emit(
                RoutingEventKind::Attempt,
                "p",
                "m",
                Some(format!("n{i}")),
            )
            .await
            .unwrap();
        }
        let recent = t.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].detail.as_deref(), Some("n2"));
        assert_eq!(recent[2].detail.as_deref(), Some("n4"));
    }

    #[tokio::test]
    async fn persisted_events_are_pruned_to_newest() {
        let (_d, t) = telemetry(10, 2).await;
        for i in 0..4 {
            t.emit(RoutingEventKind::Failure, "p", "m", Some(format!("e{i}")))
                .await
                .unwrap();
        }
        let rows: Vec<String> = t
            .store
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT detail FROM model_routing_events ORDER BY id ASC")?;
                let rows = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap();
        assert_eq!(rows, vec!["e2".to_string(), "e3".to_string()]);
    }

    #[tokio::test]
    async fn count_filters_by_kind() {
        let (_d, t) = telemetry(10, 10).await;
        t.emit(RoutingEventKind::RateLimit, "p", "m", None)
            .await
            .unwrap();
        t.emit(RoutingEventKind::Success, "p", "m", None)
            .await
            .unwrap();
        assert_eq!(t.count(RoutingEventKind::RateLimit), 1);
        assert_eq!(t.count(RoutingEventKind::Failover), 0);
    }
}
