// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Routing profile — the cost/quality stance the router orders providers by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetProfile {
    Economy,
    Balanced,
    Performance,
}

impl BudgetProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Balanced => "balanced",
            Self::Performance => "performance",
        }
    }

    /// Parse a profile name; `None` for anything unrecognised.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "economy" => Some(Self::Economy),
            "balanced" => Some(Self::Balanced),
            "performance" => Some(Self::Performance),
            _ => None,
        }
    }
}

/// Budget severity derived from usage-vs-limit ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    HardLimit,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::HardLimit => "hard_limit",
        }
    }
}

/// The governor's per-request instruction to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDirective {
    pub profile: BudgetProfile,
    pub severity: Severity,
    /// Sleep applied by the router before provider selection.
    pub pacing_delay_ms: u64,
    pub blocked_providers: Vec<String>,
    pub blocked_model_ids: Vec<String>,
    /// Advisory action tags (`intelligent_pacing`, `fallback_tightening`).
    pub actions: Vec<String>,
}

/// Outcome class of a recorded usage sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStage {
    Success,
    Failure,
    Skipped,
}

impl UsageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

/// One usage ledger entry, recorded by the router after every attempt or skip.
#[derive(Debug, Clone)]
pub struct UsageSample {
    pub session_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub profile: BudgetProfile,
    pub stage: UsageStage,
    pub request_tokens: u64,
    pub response_tokens: u64,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl UsageSample {
    /// A skip entry — the provider was never called.
    pub fn skipped(
        session_id: impl Into<String>,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        profile: BudgetProfile,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            profile,
            stage: UsageStage::Skipped,
            request_tokens: 0,
            response_tokens: 0,
            latency_ms: 0,
            status_code: None,
            error: Some(reason.into()),
        }
    }
}

/// Aggregated counters exposed at `/budget/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub severity: Severity,
    pub profile: BudgetProfile,
    pub manual_profile: Option<BudgetProfile>,
    pub daily_requests: u64,
    pub daily_request_limit: u64,
    pub daily_tokens: u64,
    pub daily_token_limit: u64,
    pub blocked_providers: Vec<String>,
}

/// One row of the budget event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetEvent {
    pub kind: String,
    pub detail: Option<String>,
    pub session_id: Option<String>,
    pub created_at: i64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_parse_roundtrip() {
        for p in [
            BudgetProfile::Economy,
            BudgetProfile::Balanced,
            BudgetProfile::Performance,
        ] {
            assert_eq!(BudgetProfile::parse(p.as_str()), Some(p));
        }
        assert_eq!(BudgetProfile::parse("turbo"), None);
    }

    #[test]
    fn severity_strings_are_wire_stable() {
        assert_eq!(Severity::HardLimit.as_str(), "hard_limit");
        assert_eq!(Severity::Warning.as_str(), "warning");
        assert_eq!(Severity::Normal.as_str(), "normal");
    }

    #[test]
    fn skipped_sample_carries_reason_and_no_tokens() {
        let s = UsageSample::skipped("s1", "primary", "gpt-4o", BudgetProfile::Economy, "blocked");
        assert_eq!(s.stage, UsageStage::Skipped);
        assert_eq!(s.request_tokens, 0);
        assert_eq!(s.error.as_deref(), Some("blocked"));
    }
}
