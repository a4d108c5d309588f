// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Result;
use chrono::Utc;
use moray_config::{BudgetConfig, ProviderConfig, ProviderTier};
use moray_store::{now_ms, rusqlite::params, Store};
use tracing::{debug, info};

use crate::{
    BudgetEvent, BudgetProfile, BudgetSnapshot, RoutingDirective, Severity, UsageSample,
};

const MANUAL_PROFILE_KEY: &str = "manual_profile";
const COOLDOWN_KEY_PREFIX: &str = "provider_cooldown:";

/// Aggregates usage and answers routing directives.
///
/// State lives in two tables: `runtime_usage_events` (append-only ledger,
/// written by [`record_usage`](Self::record_usage)) and
/// `runtime_budget_state` (manual override + provider cooldown expiries,
/// written by the two mutators).  Readers may observe a stale directive but
/// never a torn one — every read happens in a single store call.
pub struct BudgetGovernor {
    store: Store,
    cfg: BudgetConfig,
    /// Model ids blocked under `hard_limit` — flagship-tier providers, or the
    /// head of the preferred order when no tier is marked flagship.
    primary_model_ids: Vec<String>,
}

impl BudgetGovernor {
    pub fn new(store: Store, cfg: BudgetConfig, providers: &[ProviderConfig]) -> Self {
        let mut primary_model_ids: Vec<String> = providers
            .iter()
            .filter(|p| p.tier == ProviderTier::Flagship)
            .map(|p| p.model_name.clone())
            .collect();
        if primary_model_ids.is_empty() {
            if let Some(first) = providers.first() {
                primary_model_ids.push(first.model_name.clone());
            }
        }
        Self {
            store,
            cfg,
            primary_model_ids,
        }
    }

    /// Compute the routing directive for one request.  Read-mostly: the only
    /// write is the lazy sweep of expired cooldown rows.
    pub async fn routing_directive(&self, session_id: &str) -> Result<RoutingDirective> {
        let cfg = self.cfg.clone();
        let session = session_id.to_string();
        let (severity, manual, blocked_providers) = self
            .store
            .with_conn(move |conn| {
                sweep_expired_cooldowns(conn)?;
                let aggregates = read_aggregates(conn, &session)?;
                let severity = derive_severity(&aggregates, &cfg);
                let manual = read_manual_profile(conn)?;
                let blocked = read_blocked_providers(conn)?;
                Ok((severity, manual, blocked))
            })
            .await?;

        let profile = match manual {
            Some(p) => p,
            None => match severity {
                Severity::Normal => BudgetProfile::parse(&self.cfg.default_profile)
                    .unwrap_or(BudgetProfile::Performance),
                Severity::Warning => BudgetProfile::Balanced,
                Severity::HardLimit => BudgetProfile::Economy,
            },
        };

        let mut actions = Vec::new();
        let mut pacing_delay_ms = 0;
        let mut blocked_model_ids = Vec::new();
        match severity {
            Severity::Normal => {}
            Severity::Warning => {
                actions.push("intelligent_pacing".to_string());
                pacing_delay_ms = self.cfg.warning_pacing_delay_ms;
            }
            Severity::HardLimit => {
                actions.push("fallback_tightening".to_string());
                blocked_model_ids = self.primary_model_ids.clone();
            }
        }

        debug!(
            session = %session_id,
            severity = severity.as_str(),
            profile = profile.as_str(),
            "routing directive"
        );
        Ok(RoutingDirective {
            profile,
            severity,
            pacing_delay_ms,
            blocked_providers,
            blocked_model_ids,
            actions,
        })
    }

    /// Append one usage ledger entry.
    pub async fn record_usage(&self, sample: UsageSample) -> Result<()> {
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO runtime_usage_events
                     (session_id, provider_id, model_id, profile, stage,
                      request_tokens, response_tokens, latency_ms, status_code, error, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        sample.session_id,
                        sample.provider_id,
                        sample.model_id,
                        sample.profile.as_str(),
                        sample.stage.as_str(),
                        sample.request_tokens as i64,
                        sample.response_tokens as i64,
                        sample.latency_ms as i64,
                        sample.status_code.map(|c| c as i64),
                        sample.error,
                        now_ms(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Block `provider_id` until `now + provider_cooldown_ms`.
    pub async fn apply_provider_cooldown(
        &self,
        provider_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<()> {
        let until = now_ms() + self.cfg.provider_cooldown_ms as i64;
        let key = format!("{COOLDOWN_KEY_PREFIX}{provider_id}");
        let provider = provider_id.to_string();
        let session = session_id.to_string();
        let reason = reason.to_string();
        info!(provider = %provider, until, %reason, "provider cooldown");
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO runtime_budget_state (key, value, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                    params![key, until.to_string(), now_ms()],
                )?;
                record_event(
                    conn,
                    "provider_cooldown",
                    Some(format!("{provider} until {until}: {reason}")),
                    Some(session),
                )?;
                Ok(())
            })
            .await
    }

    /// Persist (or clear, with `None`) the manual profile override.
    pub async fn set_manual_profile(
        &self,
        profile: Option<BudgetProfile>,
        session_id: &str,
    ) -> Result<()> {
        let session = session_id.to_string();
        self.store
            .with_conn(move |conn| {
                match profile {
                    Some(p) => {
                        conn.execute(
                            "INSERT INTO runtime_budget_state (key, value, updated_at)
                             VALUES (?1, ?2, ?3)
                             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                            params![MANUAL_PROFILE_KEY, p.as_str(), now_ms()],
                        )?;
                    }
                    None => {
                        conn.execute(
                            "DELETE FROM runtime_budget_state WHERE key = ?1",
                            params![MANUAL_PROFILE_KEY],
                        )?;
                    }
                }
                record_event(
                    conn,
                    "profile_override",
                    Some(
                        profile
                            .map(|p| p.as_str().to_string())
                            .unwrap_or_else(|| "cleared".into()),
                    ),
                    Some(session),
                )?;
                Ok(())
            })
            .await
    }

    /// Drop the manual override and all provider cooldowns.
    pub async fn reset_policy_state(&self, session_id: &str) -> Result<()> {
        let session = session_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM runtime_budget_state
                     WHERE key = ?1 OR key LIKE ?2",
                    params![MANUAL_PROFILE_KEY, format!("{COOLDOWN_KEY_PREFIX}%")],
                )?;
                record_event(conn, "policy_reset", None, Some(session))?;
                Ok(())
            })
            .await
    }

    /// Aggregate snapshot for the control plane.
    pub async fn snapshot(&self, session_id: &str) -> Result<BudgetSnapshot> {
        let cfg = self.cfg.clone();
        let session = session_id.to_string();
        self.store
            .with_conn(move |conn| {
                sweep_expired_cooldowns(conn)?;
                let aggregates = read_aggregates(conn, &session)?;
                let severity = derive_severity(&aggregates, &cfg);
                let manual = read_manual_profile(conn)?;
                let profile = manual.unwrap_or(match severity {
                    Severity::Normal => BudgetProfile::parse(&cfg.default_profile)
                        .unwrap_or(BudgetProfile::Performance),
                    Severity::Warning => BudgetProfile::Balanced,
                    Severity::HardLimit => BudgetProfile::Economy,
                });
                Ok(BudgetSnapshot {
                    severity,
                    profile,
                    manual_profile: manual,
                    daily_requests: aggregates.daily_requests,
                    daily_request_limit: cfg.daily_request_limit,
                    daily_tokens: aggregates.daily_tokens,
                    daily_token_limit: cfg.daily_token_limit,
                    blocked_providers: read_blocked_providers(conn)?,
                })
            })
            .await
    }

    /// Newest budget events, most recent first.
    pub async fn events(&self, limit: usize) -> Result<Vec<BudgetEvent>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT kind, detail, session_id, created_at
                     FROM runtime_budget_events ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| {
                        Ok(BudgetEvent {
                            kind: row.get(0)?,
                            detail: row.get(1)?,
                            session_id: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ── Aggregation helpers (run inside one connection) ───────────────────────────

struct Aggregates {
    daily_requests: u64,
    daily_tokens: u64,
    session_requests: u64,
    max_provider_requests: u64,
}

fn utc_day_start_ms() -> i64 {
    Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp_millis())
        .unwrap_or(0)
}

fn read_aggregates(
    conn: &moray_store::rusqlite::Connection,
    session_id: &str,
) -> Result<Aggregates> {
    let since = utc_day_start_ms();
    // Skips are bookkeeping, not spend — only attempted calls count.
    let daily_requests: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runtime_usage_events
         WHERE created_at >= ?1 AND stage IN ('success', 'failure')",
        params![since],
        |r| r.get(0),
    )?;
    let daily_tokens: i64 = conn.query_row(
        "SELECT COALESCE(SUM(request_tokens + response_tokens), 0)
         FROM runtime_usage_events WHERE created_at >= ?1",
        params![since],
        |r| r.get(0),
    )?;
    let session_requests: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runtime_usage_events
         WHERE created_at >= ?1 AND session_id = ?2 AND stage IN ('success', 'failure')",
        params![since, session_id],
        |r| r.get(0),
    )?;
    let max_provider_requests: i64 = conn.query_row(
        "SELECT COALESCE(MAX(n), 0) FROM (
            SELECT COUNT(*) AS n FROM runtime_usage_events
            WHERE created_at >= ?1 AND stage IN ('success', 'failure')
            GROUP BY provider_id)",
        params![since],
        |r| r.get(0),
    )?;
    Ok(Aggregates {
        daily_requests: daily_requests as u64,
        daily_tokens: daily_tokens as u64,
        session_requests: session_requests as u64,
        max_provider_requests: max_provider_requests as u64,
    })
}

fn derive_severity(agg: &Aggregates, cfg: &BudgetConfig) -> Severity {
    let ratios = [
        ratio(agg.daily_requests, cfg.daily_request_limit),
        ratio(agg.daily_tokens, cfg.daily_token_limit),
        ratio(agg.session_requests, cfg.session_request_limit),
        ratio(agg.max_provider_requests, cfg.provider_request_limit),
    ];
    let max = ratios.into_iter().fold(0.0_f64, f64::max);
    if max >= 1.0 {
        Severity::HardLimit
    } else if max >= cfg.warning_ratio {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

fn ratio(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64
    }
}

fn read_manual_profile(
    conn: &moray_store::rusqlite::Connection,
) -> Result<Option<BudgetProfile>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM runtime_budget_state WHERE key = ?1",
            params![MANUAL_PROFILE_KEY],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            moray_store::rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(value.and_then(|v| BudgetProfile::parse(&v)))
}

fn read_blocked_providers(conn: &moray_store::rusqlite::Connection) -> Result<Vec<String>> {
    let now = now_ms();
    let mut stmt = conn.prepare(
        "SELECT key, value FROM runtime_budget_state WHERE key LIKE ?1 ORDER BY key",
    )?;
    let rows = stmt
        .query_map(params![format!("{COOLDOWN_KEY_PREFIX}%")], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, until)| until.parse::<i64>().map(|u| u > now).unwrap_or(false))
        .map(|(key, _)| key.trim_start_matches(COOLDOWN_KEY_PREFIX).to_string())
        .collect())
}

fn sweep_expired_cooldowns(conn: &moray_store::rusqlite::Connection) -> Result<()> {
    let now = now_ms();
    conn.execute(
        "DELETE FROM runtime_budget_state
         WHERE key LIKE ?1 AND CAST(value AS INTEGER) <= ?2",
        params![format!("{COOLDOWN_KEY_PREFIX}%"), now],
    )?;
    Ok(())
}

fn record_event(
    conn: &moray_store::rusqlite::Connection,
    kind: &str,
    detail: Option<String>,
    session_id: Option<String>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO runtime_budget_events (kind, detail, session_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![kind, detail, session_id, now_ms()],
    )?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsageStage;

    fn providers() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig {
                id: "primary".into(),
                model_name: "model-a".into(),
                endpoint: "http://a/v1/chat/completions".into(),
                api_key_name: "KEY_A".into(),
                tier: ProviderTier::Standard,
            },
            ProviderConfig {
                id: "fallback_1".into(),
                model_name: "model-b".into(),
                endpoint: "http://b/v1/chat/completions".into(),
                api_key_name: "KEY_B".into(),
                tier: ProviderTier::Standard,
            },
        ]
    }

    async fn governor(cfg: BudgetConfig) -> (tempfile::TempDir, BudgetGovernor) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("budget.db")).await.unwrap();
        (dir, BudgetGovernor::new(store, cfg, &providers()))
    }

    fn success_sample(session: &str) -> UsageSample {
        UsageSample {
            session_id: session.into(),
            provider_id: "primary".into(),
            model_id: "model-a".into(),
            profile: BudgetProfile::Performance,
            stage: UsageStage::Success,
            request_tokens: 100,
            response_tokens: 50,
            latency_ms: 20,
            status_code: Some(200),
            error: None,
        }
    }

    #[tokio::test]
    async fn fresh_state_is_normal() {
        let (_d, gov) = governor(BudgetConfig::default()).await;
        let d = gov.routing_directive("s1").await.unwrap();
        assert_eq!(d.severity, Severity::Normal);
        assert_eq!(d.profile, BudgetProfile::Performance);
        assert!(d.blocked_model_ids.is_empty());
        assert_eq!(d.pacing_delay_ms, 0);
    }

    #[tokio::test]
    async fn warning_ratio_triggers_balanced_with_pacing() {
        let cfg = BudgetConfig {
            daily_request_limit: 10,
            ..BudgetConfig::default()
        };
        let (_d, gov) = governor(cfg).await;
        for _ in 0..8 {
            gov.record_usage(success_sample("s1")).await.unwrap();
        }
        let d = gov.routing_directive("s1").await.unwrap();
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.profile, BudgetProfile::Balanced);
        assert!(d.pacing_delay_ms > 0);
        assert!(d.actions.iter().any(|a| a == "intelligent_pacing"));
    }

    #[tokio::test]
    async fn hard_limit_blocks_primary_model() {
        let cfg = BudgetConfig {
            daily_request_limit: 5,
            ..BudgetConfig::default()
        };
        let (_d, gov) = governor(cfg).await;
        for _ in 0..6 {
            gov.record_usage(success_sample("s1")).await.unwrap();
        }
        let d = gov.routing_directive("s1").await.unwrap();
        assert_eq!(d.severity, Severity::HardLimit);
        assert_eq!(d.profile, BudgetProfile::Economy);
        assert_eq!(d.blocked_model_ids, vec!["model-a".to_string()]);
        assert!(d.actions.iter().any(|a| a == "fallback_tightening"));
    }

    #[tokio::test]
    async fn manual_profile_wins_over_severity() {
        let cfg = BudgetConfig {
            daily_request_limit: 5,
            ..BudgetConfig::default()
        };
        let (_d, gov) = governor(cfg).await;
        for _ in 0..6 {
            gov.record_usage(success_sample("s1")).await.unwrap();
        }
        gov.set_manual_profile(Some(BudgetProfile::Performance), "s1")
            .await
            .unwrap();
        let d = gov.routing_directive("s1").await.unwrap();
        assert_eq!(d.severity, Severity::HardLimit);
        assert_eq!(d.profile, BudgetProfile::Performance);
    }

    #[tokio::test]
    async fn clearing_manual_profile_restores_mapping() {
        let (_d, gov) = governor(BudgetConfig::default()).await;
        gov.set_manual_profile(Some(BudgetProfile::Economy), "s1")
            .await
            .unwrap();
        assert_eq!(
            gov.routing_directive("s1").await.unwrap().profile,
            BudgetProfile::Economy
        );
        gov.set_manual_profile(None, "s1").await.unwrap();
        assert_eq!(
            gov.routing_directive("s1").await.unwrap().profile,
            BudgetProfile::Performance
        );
    }

    #[tokio::test]
    async fn provider_cooldown_blocks_then_expires() {
        let cfg = BudgetConfig {
            provider_cooldown_ms: 50,
            ..BudgetConfig::default()
        };
        let (_d, gov) = governor(cfg).await;
        gov.apply_provider_cooldown("primary", "s1", "rate_limit")
            .await
            .unwrap();
        let d = gov.routing_directive("s1").await.unwrap();
        assert_eq!(d.blocked_providers, vec!["primary".to_string()]);

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        let d = gov.routing_directive("s1").await.unwrap();
        assert!(d.blocked_providers.is_empty(), "cooldown must lazily expire");
    }

    #[tokio::test]
    async fn reset_policy_state_clears_overrides_and_cooldowns() {
        let (_d, gov) = governor(BudgetConfig::default()).await;
        gov.set_manual_profile(Some(BudgetProfile::Economy), "s1")
            .await
            .unwrap();
        gov.apply_provider_cooldown("primary", "s1", "test")
            .await
            .unwrap();
        gov.reset_policy_state("s1").await.unwrap();
        let d = gov.routing_directive("s1").await.unwrap();
        assert_eq!(d.profile, BudgetProfile::Performance);
        assert!(d.blocked_providers.is_empty());
    }

    #[tokio::test]
    async fn skipped_usage_does_not_count_toward_limits() {
        let cfg = BudgetConfig {
            daily_request_limit: 2,
            ..BudgetConfig::default()
        };
        let (_d, gov) = governor(cfg).await;
        for _ in 0..5 {
            gov.record_usage(UsageSample::skipped(
                "s1",
                "primary",
                "model-a",
                BudgetProfile::Economy,
                "blocked",
            ))
            .await
            .unwrap();
        }
        let d = gov.routing_directive("s1").await.unwrap();
        assert_eq!(d.severity, Severity::Normal);
    }

    #[tokio::test]
    async fn events_are_returned_newest_first() {
        let (_d, gov) = governor(BudgetConfig::default()).await;
        gov.set_manual_profile(Some(BudgetProfile::Economy), "s1")
            .await
            .unwrap();
        gov.apply_provider_cooldown("primary", "s1", "test")
            .await
            .unwrap();
        let events = gov.events(10).await.unwrap();
        assert_eq!(events[0].kind, "provider_cooldown");
        assert_eq!(events[1].kind, "profile_override");
    }

    #[tokio::test]
    async fn snapshot_reports_counters() {
        let (_d, gov) = governor(BudgetConfig::default()).await;
        gov.record_usage(success_sample("s1")).await.unwrap();
        let snap = gov.snapshot("s1").await.unwrap();
        assert_eq!(snap.daily_requests, 1);
        assert_eq!(snap.daily_tokens, 150);
        assert_eq!(snap.severity, Severity::Normal);
    }
}
