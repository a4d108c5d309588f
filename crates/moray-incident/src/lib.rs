// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Incident manager.
//!
//! Runs on a timer (or via `POST /incidents/evaluate`), reads health signals
//! from the delivery queue, the router and the session table, and applies
//! remediation playbooks under a per-type cooldown.  While an incident is in
//! cooldown the same type never re-remediates — a `cooldown_active` timeline
//! entry is appended instead.  When a signal clears, the incident resolves
//! and its remediation is rolled back.  Escalation is sticky.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moray_config::IncidentConfig;
use moray_delivery::{DeliveryQueue, QueueMode};
use moray_model::ModelRouter;
use moray_store::{now_ms, rusqlite::params, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const TYPE_QUEUE_BACKPRESSURE: &str = "queue_backpressure";
pub const TYPE_CALLBACK_STORM: &str = "callback_failure_storm";
pub const TYPE_ROUTING_INSTABILITY: &str = "model_routing_instability";
pub const TYPE_CONTEXT_DEGRADATION: &str = "context_degradation_sustained";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Active,
    Remediating,
    Escalated,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Remediating => "remediating",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "remediating" => Some(Self::Remediating),
            "escalated" => Some(Self::Escalated),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub incident_type: String,
    pub severity: String,
    pub status: IncidentStatus,
    pub cooldown_until: Option<i64>,
    pub remediation_action: String,
    pub attempts: u32,
    pub evidence: Value,
    pub recommended_actions: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One detector's reading for this evaluation pass.
struct Signal {
    firing: bool,
    severity: &'static str,
    remediation_action: &'static str,
    evidence: Value,
    recommended: Vec<String>,
}

pub struct IncidentManager {
    store: Store,
    cfg: IncidentConfig,
    queue: Arc<DeliveryQueue>,
    router: Arc<ModelRouter>,
}

impl IncidentManager {
    pub fn new(
        store: Store,
        cfg: IncidentConfig,
        queue: Arc<DeliveryQueue>,
        router: Arc<ModelRouter>,
    ) -> Self {
        Self {
            store,
            cfg,
            queue,
            router,
        }
    }

    /// One full evaluation pass over all detectors.  Returns the currently
    /// open (non-resolved) incidents after the pass.
    pub async fn evaluate(&self) -> Result<Vec<IncidentRecord>> {
        let backpressure = self.detect_queue_backpressure().await?;
        self.drive(TYPE_QUEUE_BACKPRESSURE, backpressure).await?;

        let storm = self.detect_callback_storm().await?;
        self.drive(TYPE_CALLBACK_STORM, storm).await?;

        let routing = self.detect_routing_instability();
        self.drive(TYPE_ROUTING_INSTABILITY, routing).await?;

        let degradation = self.detect_context_degradation().await?;
        self.drive(TYPE_CONTEXT_DEGRADATION, degradation).await?;

        self.current().await
    }

    // ── Detectors ─────────────────────────────────────────────────────────────

    async fn detect_queue_backpressure(&self) -> Result<Signal> {
        let stats = self.queue.stats().await?;
        let pending = stats.queued + stats.dispatching;
        Ok(Signal {
            firing: pending >= self.cfg.queue_backpressure_threshold,
            severity: "warning",
            remediation_action: "set_queue_mode_throttled",
            evidence: json!({
                "queued": stats.queued,
                "dispatching": stats.dispatching,
                "threshold": self.cfg.queue_backpressure_threshold,
                "previous_mode": mode_str(self.queue.controls().mode),
            }),
            recommended: vec![
                "inspect slow outbound adapters".into(),
                "raise queue worker batch size if sustained".into(),
            ],
        })
    }

    async fn detect_callback_storm(&self) -> Result<Signal> {
        let since = now_ms() - self.cfg.callback_window_ms as i64;
        let rejected: i64 = self
            .store
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM callback_receipts
                     WHERE outcome = 'rejected' AND created_at >= ?1",
                    params![since],
                    |r| r.get(0),
                )?)
            })
            .await?;
        Ok(Signal {
            firing: rejected as u64 >= self.cfg.callback_failure_burst_threshold,
            severity: "warning",
            remediation_action: "widen_retry_window",
            evidence: json!({
                "rejected_in_window": rejected,
                "window_ms": self.cfg.callback_window_ms,
                "previous_multiplier": self.queue.controls().retry_window_multiplier,
            }),
            recommended: vec!["verify webhook signatures and sender clock".into()],
        })
    }

    fn detect_routing_instability(&self) -> Signal {
        let health = self.router.health_snapshot();
        Signal {
            firing: health.consecutive_failures >= self.cfg.model_routing_failure_threshold,
            severity: "critical",
            remediation_action: "force_failover",
            evidence: json!({
                "consecutive_failures": health.consecutive_failures,
                "failover_count": health.failover_count,
                "current_model": health.current_model_id,
            }),
            recommended: vec!["check provider status pages".into()],
        }
    }

    async fn detect_context_degradation(&self) -> Result<Signal> {
        let max_streak: i64 = self
            .store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COALESCE(MAX(degraded_streak), 0) FROM sessions",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await?;
        Ok(Signal {
            firing: max_streak as u32 >= self.cfg.context_degradation_threshold,
            severity: "info",
            remediation_action: "advisory",
            evidence: json!({ "max_degraded_streak": max_streak }),
            recommended: vec![
                "review context budgets for the degraded session".into(),
                "consider archiving the session history".into(),
            ],
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    async fn drive(&self, incident_type: &str, signal: Signal) -> Result<()> {
        let open = self.open_incident(incident_type).await?;
        match (signal.firing, open) {
            (true, None) => self.open_and_remediate(incident_type, signal).await,
            (true, Some(incident)) => self.re_evaluate_open(incident, signal).await,
            (false, Some(incident)) => self.resolve(incident).await,
            (false, None) => Ok(()),
        }
    }

    async fn open_and_remediate(&self, incident_type: &str, signal: Signal) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        info!(incident = %incident_type, id = %id, "incident detected");
        self.insert_incident(&id, incident_type, &signal).await?;
        self.timeline(&id, "detected", Some(signal.evidence.to_string()))
            .await?;

        self.apply_remediation(signal.remediation_action).await?;
        let cooldown_until = now_ms() + self.cfg.remediation_cooldown_ms as i64;
        self.update_incident(&id, IncidentStatus::Remediating, Some(cooldown_until), 1)
            .await?;
        self.timeline(&id, "remediated", Some(signal.remediation_action.into()))
            .await
    }

    async fn re_evaluate_open(&self, incident: IncidentRecord, signal: Signal) -> Result<()> {
        let in_cooldown = incident
            .cooldown_until
            .map(|until| until > now_ms())
            .unwrap_or(false);
        if in_cooldown {
            // Never re-remediate inside the cooldown, whatever the status.
            self.timeline(&incident.id, "cooldown_active", None).await?;
            return Ok(());
        }
        match incident.status {
            IncidentStatus::Escalated => {
                // Sticky: an escalated incident stays escalated while the
                // signal persists.
                self.timeline(&incident.id, "still_escalated", None).await
            }
            _ => {
                warn!(
                    incident = %incident.incident_type,
                    id = %incident.id,
                    "signal persists after remediation; escalating"
                );
                self.update_incident(
                    &incident.id,
                    IncidentStatus::Escalated,
                    incident.cooldown_until,
                    incident.attempts,
                )
                .await?;
                self.timeline(&incident.id, "escalated", Some(signal.evidence.to_string()))
                    .await
            }
        }
    }

    async fn resolve(&self, incident: IncidentRecord) -> Result<()> {
        info!(incident = %incident.incident_type, id = %incident.id, "signal cleared; resolving");
        self.rollback_remediation(&incident).await;
        self.update_incident(
            &incident.id,
            IncidentStatus::Resolved,
            incident.cooldown_until,
            incident.attempts,
        )
        .await?;
        self.timeline(&incident.id, "resolved", None).await
    }

    async fn apply_remediation(&self, action: &str) -> Result<()> {
        match action {
            "set_queue_mode_throttled" => self.queue.set_mode(QueueMode::Throttled),
            "widen_retry_window" => {
                let current = self.queue.controls().retry_window_multiplier;
                self.queue.set_retry_window_multiplier(current * 2.0);
            }
            "force_failover" => self.router.force_failover().await?,
            "advisory" => {}
            other => warn!(action = %other, "unknown remediation action"),
        }
        Ok(())
    }

    /// Undo the applied remediation using the values captured in evidence.
    async fn rollback_remediation(&self, incident: &IncidentRecord) {
        match incident.remediation_action.as_str() {
            "set_queue_mode_throttled" => {
                let previous = incident.evidence["previous_mode"]
                    .as_str()
                    .and_then(parse_mode)
                    .unwrap_or(QueueMode::Normal);
                self.queue.set_mode(previous);
            }
            "widen_retry_window" => {
                let previous = incident.evidence["previous_multiplier"]
                    .as_f64()
                    .unwrap_or(1.0);
                self.queue.set_retry_window_multiplier(previous);
            }
            // force_failover and advisory have nothing to roll back; the
            // preferred head is reset by the operator when providers recover.
            _ => {}
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    async fn open_incident(&self, incident_type: &str) -> Result<Option<IncidentRecord>> {
        let t = incident_type.to_string();
        self.store
            .with_conn(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT id, incident_type, severity, status, cooldown_until,
                                remediation_action, attempts, evidence_json, recommended_json,
                                created_at, updated_at
                         FROM incidents
                         WHERE incident_type = ?1 AND status != 'resolved'
                         ORDER BY created_at DESC LIMIT 1",
                        params![t],
                        row_to_incident,
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

    async fn insert_incident(&self, id: &str, incident_type: &str, signal: &Signal) -> Result<()> {
        let id = id.to_string();
        let t = incident_type.to_string();
        let severity = signal.severity.to_string();
        let action = signal.remediation_action.to_string();
        let evidence = signal.evidence.to_string();
        let recommended = serde_json::to_string(&signal.recommended)?;
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO incidents
                     (id, incident_type, severity, status, cooldown_until, remediation_action,
                      attempts, evidence_json, recommended_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'active', NULL, ?4, 0, ?5, ?6, ?7, ?7)",
                    params![id, t, severity, action, evidence, recommended, now_ms()],
                )?;
                Ok(())
            })
            .await
    }

    async fn update_incident(
        &self,
        id: &str,
        status: IncidentStatus,
        cooldown_until: Option<i64>,
        attempts: u32,
    ) -> Result<()> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE incidents
                     SET status = ?1, cooldown_until = ?2, attempts = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![status.as_str(), cooldown_until, attempts as i64, now_ms(), id],
                )?;
                Ok(())
            })
            .await
    }

    async fn timeline(&self, incident_id: &str, kind: &str, detail: Option<String>) -> Result<()> {
        let id = incident_id.to_string();
        let kind = kind.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO incident_timeline (incident_id, kind, detail, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, kind, detail, now_ms()],
                )?;
                Ok(())
            })
            .await
    }

    /// Open (non-resolved) incidents.
    pub async fn current(&self) -> Result<Vec<IncidentRecord>> {
        self.query_incidents("status != 'resolved'").await
    }

    /// Every incident, newest first.
    pub async fn history(&self) -> Result<Vec<IncidentRecord>> {
        self.query_incidents("1 = 1").await
    }

    async fn query_incidents(&self, filter: &'static str) -> Result<Vec<IncidentRecord>> {
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT id, incident_type, severity, status, cooldown_until,
                            remediation_action, attempts, evidence_json, recommended_json,
                            created_at, updated_at
                     FROM incidents WHERE {filter} ORDER BY created_at DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_incident)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Timeline entry kinds for one incident, oldest first.
    pub async fn timeline_kinds(&self, incident_id: &str) -> Result<Vec<String>> {
        let id = incident_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT kind FROM incident_timeline WHERE incident_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![id], |r| r.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Evaluate on a fixed interval until cancelled.
pub fn spawn_timer(manager: Arc<IncidentManager>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(manager.cfg.evaluation_interval_ms.max(100));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = manager.evaluate().await {
                warn!(error = %e, "incident evaluation failed");
            }
        }
    })
}

fn mode_str(mode: QueueMode) -> &'static str {
    match mode {
        QueueMode::Normal => "normal",
        QueueMode::Throttled => "throttled",
        QueueMode::Drain => "drain",
    }
}

fn parse_mode(s: &str) -> Option<QueueMode> {
    match s {
        "normal" => Some(QueueMode::Normal),
        "throttled" => Some(QueueMode::Throttled),
        "drain" => Some(QueueMode::Drain),
        _ => None,
    }
}

fn row_to_incident(
    row: &moray_store::rusqlite::Row<'_>,
) -> moray_store::rusqlite::Result<IncidentRecord> {
    let evidence: String = row.get(7)?;
    let recommended: String = row.get(8)?;
    Ok(IncidentRecord {
        id: row.get(0)?,
        incident_type: row.get(1)?,
        severity: row.get(2)?,
        status: IncidentStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(IncidentStatus::Active),
        cooldown_until: row.get(4)?,
        remediation_action: row.get(5)?,
        attempts: row.get::<_, i64>(6)? as u32,
        evidence: serde_json::from_str(&evidence).unwrap_or(Value::Null),
        recommended_actions: serde_json::from_str(&recommended).unwrap_or_default(),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
