// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    /// Ordered provider list — the *preferred order* used by the router.
    /// The first entry is the primary model; later entries are fallbacks.
    ///
    /// ```yaml
    /// providers:
    ///   - id: primary
    ///     model_name: gpt-4o
    ///     endpoint: https://api.openai.com/v1/chat/completions
    ///     api_key_name: OPENAI_API_KEY
    ///   - id: fallback_1
    ///     model_name: llama-3.3-70b-versatile
    ///     endpoint: https://api.groq.com/openai/v1/chat/completions
    ///     api_key_name: GROQ_API_KEY
    /// ```
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub incident: IncidentConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Path of the SQLite database file. Defaults to `moray.db` next to the
    /// process working directory; `moray serve` warns when left on default.
    #[serde(default)]
    pub store_path: Option<String>,
}

// ── API / control plane ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// TCP port of the HTTP control plane.
    pub api_port: u16,
    /// Name of the environment variable holding the HMAC signing secret.
    /// The secret itself never appears in config files.
    pub api_secret_name: String,
    /// Failed-signature attempts allowed per minute per IP before lockout.
    pub auth_failures_per_minute: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_port: 8787,
            api_secret_name: "MORAY_API_SECRET".into(),
            auth_failures_per_minute: 5,
        }
    }
}

// ── Providers ─────────────────────────────────────────────────────────────────

/// A single upstream model provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identifier used in telemetry, budget rows and cooldowns.
    pub id: String,
    /// Model name forwarded to the provider API.
    pub model_name: String,
    /// Full chat-completions URL.
    pub endpoint: String,
    /// Environment variable that holds the API key (read at call time).
    /// A provider whose variable is unset is skipped during selection.
    pub api_key_name: String,
    /// Cost/quality tier used by the fixed rank tables of the `balanced`
    /// and `economy` routing profiles.
    #[serde(default)]
    pub tier: ProviderTier,
}

/// Rank-table tier of a provider.  `performance` ordering ignores tiers and
/// uses the configured (preferred) order directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    Flagship,
    #[default]
    Standard,
    Economy,
}

// ── Router ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Cooldown applied on a 429 without a parsable Retry-After header.
    /// Floor is 1s; lower configured values are clamped.
    pub default_rate_limit_cooldown_ms: u64,
    /// In `intelligent_pacing` mode, the longest the router will sleep
    /// waiting out a cooldown before failing over anyway.
    pub intelligent_pacing_max_wait_ms: u64,
    /// Capacity of the in-memory telemetry ring buffer (drop-oldest).
    pub max_runtime_events: usize,
    /// Rows retained in the persisted routing-events table (newest kept).
    pub max_persisted_events: usize,
    /// Startup fallback mode; the persisted setting wins once written.
    pub fallback_mode: String,
    /// Per-attempt HTTP timeout.
    pub request_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_rate_limit_cooldown_ms: 30_000,
            intelligent_pacing_max_wait_ms: 8_000,
            max_runtime_events: 256,
            max_persisted_events: 500,
            fallback_mode: "intelligent_pacing".into(),
            request_timeout_ms: 60_000,
        }
    }
}

// ── Budget ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_request_limit: u64,
    pub daily_token_limit: u64,
    pub session_request_limit: u64,
    pub provider_request_limit: u64,
    /// Fraction of any limit at which severity becomes `warning`.
    pub warning_ratio: f64,
    /// How long `apply_provider_cooldown` blocks a provider.
    pub provider_cooldown_ms: u64,
    /// Pacing delay attached to `warning` directives.
    pub warning_pacing_delay_ms: u64,
    /// Profile used when severity is `normal` and no manual override is set.
    pub default_profile: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_request_limit: 120,
            daily_token_limit: 400_000,
            session_request_limit: 60,
            provider_request_limit: 80,
            warning_ratio: 0.8,
            provider_cooldown_ms: 60_000,
            warning_pacing_delay_ms: 750,
            default_profile: "performance".into(),
        }
    }
}

// ── Conversation gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Upper bound on model → tools → model rounds per inbound message.
    pub max_tool_rounds: u32,
    /// Complexity score at or above which delegation is considered.
    pub delegation_min_score: u32,
    #[serde(default = "default_true")]
    pub delegation_enabled: bool,
    /// Optional persona file prepended to the system prompt.
    pub persona_path: Option<String>,
    /// Per-call timeout for a single tool invocation.
    pub tool_timeout_ms: u64,
    #[serde(default)]
    pub context: ContextBudgets,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 6,
            delegation_min_score: 2,
            delegation_enabled: true,
            persona_path: None,
            tool_timeout_ms: 30_000,
            context: ContextBudgets::default(),
        }
    }
}

/// Approximate token budgets for the tiers of the composed system prompt.
/// A tier over budget is compacted deterministically (provenance labels kept).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudgets {
    pub system_tokens: usize,
    pub hot_window_tokens: usize,
    pub warm_summary_tokens: usize,
    pub archive_summary_tokens: usize,
}

impl Default for ContextBudgets {
    fn default() -> Self {
        Self {
            system_tokens: 1_500,
            hot_window_tokens: 3_000,
            warm_summary_tokens: 800,
            archive_summary_tokens: 400,
        }
    }
}

// ── Delegation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    pub max_concurrent_jobs: usize,
    /// A failed job re-queues while `attempt <= max_retry_attempts`.
    pub max_retry_attempts: u32,
    /// Consecutive run-level failures that open the circuit breaker.
    pub failure_circuit_breaker_threshold: u32,
    /// Default per-job timeout when a brief carries none.
    pub default_job_timeout_ms: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_retry_attempts: 1,
            failure_circuit_breaker_threshold: 3,
            default_job_timeout_ms: 120_000,
        }
    }
}

// ── Delivery queue ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Dispatches before a delivery moves to the dead-letter state.
    pub max_attempts: u32,
    /// Base of the exponential backoff between failed attempts.
    pub base_backoff_ms: u64,
    /// Worker polling interval.
    pub poll_interval_ms: u64,
    /// Rows claimed per polling cycle (halved in `throttled` mode).
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 2_000,
            poll_interval_ms: 1_000,
            batch_size: 8,
        }
    }
}

// ── Incident manager ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentConfig {
    /// Re-remediation of the same incident type is blocked for this long.
    pub remediation_cooldown_ms: u64,
    pub evaluation_interval_ms: u64,
    /// queued + dispatching deliveries that count as backpressure.
    pub queue_backpressure_threshold: u64,
    /// Rejected callback outcomes inside the window that count as a storm.
    pub callback_failure_burst_threshold: u64,
    /// Window inspected by the callback-storm detector.
    pub callback_window_ms: u64,
    /// Consecutive router failures that count as routing instability.
    pub model_routing_failure_threshold: u32,
    /// Max consecutive compacted turns before a session counts as degraded.
    pub context_degradation_threshold: u32,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            remediation_cooldown_ms: 300_000,
            evaluation_interval_ms: 30_000,
            queue_backpressure_threshold: 25,
            callback_failure_burst_threshold: 5,
            callback_window_ms: 600_000,
            model_routing_failure_threshold: 4,
            context_degradation_threshold: 3,
        }
    }
}

// ── Memory / reasoning ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Dimension of stored embedding vectors. Must match the external
    /// embedder; rows of a different dimension are ignored at query time.
    pub memory_embedding_dim: usize,
    pub retrieval_top_k: usize,
    /// Depth cap of the reasoning-graph evidence traversal.
    pub max_depth: usize,
    /// Edge fan-out cap per traversal step.
    pub edge_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_embedding_dim: 256,
            retrieval_top_k: 5,
            max_depth: 2,
            edge_limit: 16,
        }
    }
}

// ── Tool policy ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// The global profile applied when no session override matches.
    #[serde(default)]
    pub global: PolicyProfileConfig,
    /// Per-session profile overrides keyed by session id.
    #[serde(default)]
    pub session_overrides: std::collections::HashMap<String, PolicyProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyProfileConfig {
    pub id: String,
    /// "allow" | "deny" | "fallback" — fallback defers to the next layer.
    pub default_action: String,
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
}

impl Default for PolicyProfileConfig {
    fn default() -> Self {
        Self {
            id: "global-default".into(),
            default_action: "allow".into(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    /// Tool name, or `*` to match any tool.
    pub skill_name: String,
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
}

// ── Redaction ─────────────────────────────────────────────────────────────────

impl Config {
    /// Serialize the effective config for display.  Secret *names* are kept
    /// (they are env-var names, not values); nothing else in the schema holds
    /// secret material, so the dump is safe to print.
    pub fn to_display_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.conversation.max_tool_rounds, 6);
        assert_eq!(cfg.conversation.delegation_min_score, 2);
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.budget.warning_ratio, 0.8);
        assert_eq!(cfg.router.fallback_mode, "intelligent_pacing");
    }

    #[test]
    fn provider_tier_defaults_to_standard() {
        let yaml = r#"
id: primary
model_name: gpt-4o
endpoint: https://example.com/v1/chat/completions
api_key_name: OPENAI_API_KEY
"#;
        let p: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.tier, ProviderTier::Standard);
    }

    #[test]
    fn delegation_enabled_defaults_on() {
        let yaml = "max_tool_rounds: 4\ndelegation_min_score: 2\ntool_timeout_ms: 1000";
        let c: ConversationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(c.delegation_enabled);
    }

    #[test]
    fn display_yaml_contains_no_raw_secret_field() {
        let cfg = Config::default();
        let dump = cfg.to_display_yaml();
        // The schema stores env-var *names*, never values.
        assert!(dump.contains("api_secret_name"));
        assert!(!dump.contains("sk-"));
    }

    #[test]
    fn policy_rule_roundtrips() {
        let yaml = "skill_name: shell\naction: deny\nreason: interactive only";
        let r: PolicyRuleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(r.skill_name, "shell");
        assert_eq!(r.action, "deny");
        assert_eq!(r.reason.as_deref(), Some("interactive only"));
    }
}
