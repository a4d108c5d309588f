// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use moray_budget::{BudgetGovernor, BudgetProfile, RoutingDirective, UsageSample, UsageStage};
use moray_config::{ProviderConfig, ProviderTier, RouterConfig};
use moray_store::{now_ms, rusqlite::params, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    parse_retry_after,
    telemetry::{RoutingEvent, RoutingEventKind, Telemetry},
    transport::{ChatTransport, TransportReply},
    AssistantMessage, ChatMessage, ToolCallPayload, ToolSchema,
};

const MODE_SETTING_KEY: &str = "fallback_mode";
const HEAD_SETTING_KEY: &str = "preferred_head";

/// Rate-limit cooldowns shorter than this are pointless; clamp up.
const MIN_COOLDOWN: Duration = Duration::from_secs(1);

/// Router strategy on rate limits and cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Wait briefly for the same provider before switching.
    IntelligentPacing,
    /// Switch immediately on any 429 or hard failure.
    AggressiveFallback,
}

impl FallbackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntelligentPacing => "intelligent_pacing",
            Self::AggressiveFallback => "aggressive_fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "intelligent_pacing" => Some(Self::IntelligentPacing),
            "aggressive_fallback" => Some(Self::AggressiveFallback),
            _ => None,
        }
    }
}

/// Per-provider counters, mutated only by router attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limits: u64,
    pub last_used_at: Option<i64>,
    pub last_error: Option<String>,
    pub cooldown_until_ms: Option<i64>,
    pub cooldown_reason: Option<String>,
}

impl ProviderUsage {
    fn cooldown_remaining(&self, now: i64) -> Option<Duration> {
        match self.cooldown_until_ms {
            Some(until) if until > now => Some(Duration::from_millis((until - now) as u64)),
            _ => None,
        }
    }
}

/// Snapshot returned to the incident manager and `/routing/telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterHealth {
    pub providers: Vec<(String, ProviderUsage)>,
    pub consecutive_failures: u32,
    pub failover_count: u64,
    pub current_model_id: Option<String>,
    pub fallback_mode: FallbackMode,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no model providers configured")]
    NoProvidersConfigured,
    #[error("all providers exhausted after {tried} attempts")]
    AllProvidersExhausted {
        tried: usize,
        last_error: Option<String>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct RouterState {
    usage: HashMap<String, ProviderUsage>,
    preferred_head: usize,
    current_model_id: Option<String>,
    consecutive_failures: u32,
    failover_count: u64,
}

/// Multi-provider failover router.
///
/// Selection per request: budget directive → pacing sleep → profile ordering
/// → blocked/keyless/cooling skips → HTTP attempt with rate-limit handling.
pub struct ModelRouter {
    providers: Vec<ProviderConfig>,
    cfg: RouterConfig,
    store: Store,
    budget: Arc<BudgetGovernor>,
    transport: Arc<dyn ChatTransport>,
    telemetry: Telemetry,
    state: Mutex<RouterState>,
    mode: Mutex<FallbackMode>,
}

impl ModelRouter {
    /// Build a router, restoring the persisted fallback mode and preferred
    /// head if a previous process wrote them.
    pub async fn new(
        store: Store,
        cfg: RouterConfig,
        providers: Vec<ProviderConfig>,
        budget: Arc<BudgetGovernor>,
        transport: Arc<dyn ChatTransport>,
    ) -> Result<Self> {
        let (persisted_mode, persisted_head) = store
            .with_conn(|conn| {
                let read = |key: &str| -> Result<Option<String>> {
                    let v = conn
                        .query_row(
                            "SELECT value FROM model_routing_settings WHERE key = ?1",
                            params![key],
                            |r| r.get::<_, String>(0),
                        )
                        .map(Some)
                        .or_else(|e| match e {
                            moray_store::rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    Ok(v)
                };
                Ok((read(MODE_SETTING_KEY)?, read(HEAD_SETTING_KEY)?))
            })
            .await?;

        let mode = persisted_mode
            .as_deref()
            .and_then(FallbackMode::parse)
            .or_else(|| FallbackMode::parse(&cfg.fallback_mode))
            .unwrap_or(FallbackMode::IntelligentPacing);
        let head = persisted_head
            .and_then(|h| h.parse::<usize>().ok())
            .filter(|h| !providers.is_empty() && *h < providers.len())
            .unwrap_or(0);

        let usage = providers
            .iter()
            .map(|p| (p.id.clone(), ProviderUsage::default()))
            .collect();

        let telemetry = Telemetry::new(
            store.clone(),
            cfg.max_runtime_events,
            cfg.max_persisted_events,
        );

        Ok(Self {
            providers,
            cfg,
            store,
            budget,
            transport,
            telemetry,
            state: Mutex::new(RouterState {
                usage,
                preferred_head: head,
                current_model_id: None,
                consecutive_failures: 0,
                failover_count: 0,
            }),
            mode: Mutex::new(mode),
        })
    }

    /// Route one chat completion.  Fails with
    /// [`RouterError::AllProvidersExhausted`] only after every configured
    /// provider has been tried (or skipped) without a usable response.
    pub async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        session_id: &str,
    ) -> Result<AssistantMessage, RouterError> {
        if self.providers.is_empty() {
            return Err(RouterError::NoProvidersConfigured);
        }

        let directive = self.budget.routing_directive(session_id).await?;
        if directive.pacing_delay_ms > 0 {
            debug!(delay_ms = directive.pacing_delay_ms, "budget pacing");
            tokio::time::sleep(Duration::from_millis(directive.pacing_delay_ms)).await;
        }

        let order = self.provider_order(directive.profile);
        let mode = *self.mode.lock().unwrap();
        let mut tried = 0usize;
        let mut last_error: Option<String> = None;

        for (position, provider) in order.iter().enumerate() {
            if !self
                .pass_directive_gate(provider, &directive, session_id)
                .await?
            {
                continue;
            }

            let Some(api_key) = std::env::var(&provider.api_key_name).ok().filter(|k| !k.is_empty())
            else {
                debug!(provider = %provider.id, key = %provider.api_key_name, "no API key; skipping");
                continue;
            };

            if !self.pass_cooldown_gate(provider, mode).await? {
                continue;
            }

            tried += 1;
            match self
                .attempt_with_pacing(provider, &api_key, messages, tools, session_id, &directive, mode)
                .await?
            {
                Some(message) => return Ok(message),
                None => {
                    let state_error = self
                        .state
                        .lock()
                        .unwrap()
                        .usage
                        .get(&provider.id)
                        .and_then(|u| u.last_error.clone());
                    last_error = state_error.or(last_error);
                    // Another candidate remains — this is a failover.
                    if position + 1 < order.len() {
                        {
                            let mut state = self.state.lock().unwrap();
                            state.failover_count += 1;
                        }
                        self.telemetry
                            .emit(
                                RoutingEventKind::Failover,
                                &provider.id,
                                &provider.model_name,
                                Some("advancing to next provider".into()),
                            )
                            .await?;
                    }
                }
            }
        }

        Err(RouterError::AllProvidersExhausted { tried, last_error })
    }

    /// Rotate the preferred head by one; used by incident remediation.
    pub async fn force_failover(&self) -> Result<()> {
        let (head, provider) = {
            let mut state = self.state.lock().unwrap();
            state.preferred_head = (state.preferred_head + 1) % self.providers.len().max(1);
            state.failover_count += 1;
            (
                state.preferred_head,
                self.providers
                    .get(state.preferred_head)
                    .map(|p| (p.id.clone(), p.model_name.clone())),
            )
        };
        self.persist_setting(HEAD_SETTING_KEY, &head.to_string())
            .await?;
        let (pid, model) = provider.unwrap_or_default();
        info!(head, provider = %pid, "forced failover");
        self.telemetry
            .emit(
                RoutingEventKind::Failover,
                &pid,
                &model,
                Some("forced".into()),
            )
            .await
    }

    /// Restore the configured preferred order.
    pub async fn reset_preferred_model(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.preferred_head = 0;
        }
        self.persist_setting(HEAD_SETTING_KEY, "0").await
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        *self.mode.lock().unwrap()
    }

    /// The budget governor this router consults.
    pub fn budget(&self) -> &Arc<BudgetGovernor> {
        &self.budget
    }

    /// Switch fallback mode; persisted so restarts keep the operator's choice.
    pub async fn set_fallback_mode(&self, mode: FallbackMode) -> Result<()> {
        {
            *self.mode.lock().unwrap() = mode;
        }
        self.persist_setting(MODE_SETTING_KEY, mode.as_str()).await?;
        self.telemetry
            .emit(
                RoutingEventKind::ModeChange,
                "",
                "",
                Some(mode.as_str().into()),
            )
            .await
    }

    pub fn health_snapshot(&self) -> RouterHealth {
        let state = self.state.lock().unwrap();
        let providers = self
            .providers
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    state.usage.get(&p.id).cloned().unwrap_or_default(),
                )
            })
            .collect();
        RouterHealth {
            providers,
            consecutive_failures: state.consecutive_failures,
            failover_count: state.failover_count,
            current_model_id: state.current_model_id.clone(),
            fallback_mode: *self.mode.lock().unwrap(),
        }
    }

    /// The in-memory telemetry ring, oldest first.
    pub fn recent_events(&self) -> Vec<RoutingEvent> {
        self.telemetry.recent()
    }

    pub fn count_events(&self, kind: RoutingEventKind) -> usize {
        self.telemetry.count(kind)
    }

    // ── Selection internals ───────────────────────────────────────────────────

    /// Provider order for a profile.  `performance` uses the preferred order
    /// (rotated by the current head); `balanced` and `economy` use fixed rank
    /// tables over the provider tiers, stable within a rank.
    fn provider_order(&self, profile: BudgetProfile) -> Vec<ProviderConfig> {
        let head = self.state.lock().unwrap().preferred_head;
        let mut rotated: Vec<ProviderConfig> = self
            .providers
            .iter()
            .cycle()
            .skip(head)
            .take(self.providers.len())
            .cloned()
            .collect();
        match profile {
            BudgetProfile::Performance => rotated,
            BudgetProfile::Balanced => {
                rotated.sort_by_key(|p| match p.tier {
                    ProviderTier::Standard => 0u8,
                    ProviderTier::Flagship => 1,
                    ProviderTier::Economy => 2,
                });
                rotated
            }
            BudgetProfile::Economy => {
                rotated.sort_by_key(|p| match p.tier {
                    ProviderTier::Economy => 0u8,
                    ProviderTier::Standard => 1,
                    ProviderTier::Flagship => 2,
                });
                rotated
            }
        }
    }

    /// Returns false when the directive blocks this provider; records the
    /// skip in both the usage ledger and telemetry.
    async fn pass_directive_gate(
        &self,
        provider: &ProviderConfig,
        directive: &RoutingDirective,
        session_id: &str,
    ) -> Result<bool> {
        let blocked_provider = directive
            .blocked_providers
            .iter()
            .any(|b| b == &provider.id);
        let blocked_model = directive
            .blocked_model_ids
            .iter()
            .any(|m| m == &provider.model_name);
        if !blocked_provider && !blocked_model {
            return Ok(true);
        }
        let reason = if blocked_provider {
            "provider blocked by budget directive"
        } else {
            "model blocked by budget directive"
        };
        self.budget
            .record_usage(UsageSample::skipped(
                session_id,
                &provider.id,
                &provider.model_name,
                directive.profile,
                reason,
            ))
            .await?;
        self.telemetry
            .emit(
                RoutingEventKind::CooldownSkip,
                &provider.id,
                &provider.model_name,
                Some(reason.into()),
            )
            .await?;
        Ok(false)
    }

    /// Returns false when the provider's own cooldown keeps it out of this
    /// request.  Intelligent pacing waits out short cooldowns instead.
    async fn pass_cooldown_gate(
        &self,
        provider: &ProviderConfig,
        mode: FallbackMode,
    ) -> Result<bool> {
        let remaining = {
            let state = self.state.lock().unwrap();
            state
                .usage
                .get(&provider.id)
                .and_then(|u| u.cooldown_remaining(now_ms()))
        };
        let Some(remaining) = remaining else {
            return Ok(true);
        };

        let max_wait = Duration::from_millis(self.cfg.intelligent_pacing_max_wait_ms);
        if mode == FallbackMode::IntelligentPacing && remaining <= max_wait {
            self.telemetry
                .emit(
                    RoutingEventKind::CooldownWait,
                    &provider.id,
                    &provider.model_name,
                    Some(format!("waiting {}ms", remaining.as_millis())),
                )
                .await?;
            tokio::time::sleep(remaining).await;
            // Re-check once; the cooldown may have been extended meanwhile.
            let still_cooling = {
                let state = self.state.lock().unwrap();
                state
                    .usage
                    .get(&provider.id)
                    .and_then(|u| u.cooldown_remaining(now_ms()))
                    .is_some()
            };
            if !still_cooling {
                return Ok(true);
            }
        }
        self.telemetry
            .emit(
                RoutingEventKind::CooldownSkip,
                &provider.id,
                &provider.model_name,
                Some(format!("cooling for {}ms", remaining.as_millis())),
            )
            .await?;
        Ok(false)
    }

    /// One provider's attempt(s): a rate-limited intelligent-pacing attempt
    /// may retry the same provider once after the advertised wait.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_with_pacing(
        &self,
        provider: &ProviderConfig,
        api_key: &str,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        session_id: &str,
        directive: &RoutingDirective,
        mode: FallbackMode,
    ) -> Result<Option<AssistantMessage>> {
        match self
            .attempt(provider, api_key, messages, tools, session_id, directive)
            .await?
        {
            Attempt::Success(msg) => Ok(Some(msg)),
            Attempt::RateLimited { wait } => {
                let max_wait = Duration::from_millis(self.cfg.intelligent_pacing_max_wait_ms);
                if mode == FallbackMode::IntelligentPacing && wait <= max_wait {
                    self.telemetry
                        .emit(
                            RoutingEventKind::CooldownWait,
                            &provider.id,
                            &provider.model_name,
                            Some(format!("pacing retry after {}ms", wait.as_millis())),
                        )
                        .await?;
                    tokio::time::sleep(wait).await;
                    match self
                        .attempt(provider, api_key, messages, tools, session_id, directive)
                        .await?
                    {
                        Attempt::Success(msg) => Ok(Some(msg)),
                        _ => Ok(None),
                    }
                } else {
                    Ok(None)
                }
            }
            Attempt::Failed => Ok(None),
        }
    }

    /// A single HTTP attempt against one provider.
    async fn attempt(
        &self,
        provider: &ProviderConfig,
        api_key: &str,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        session_id: &str,
        directive: &RoutingDirective,
    ) -> Result<Attempt> {
        self.telemetry
            .emit(
                RoutingEventKind::Attempt,
                &provider.id,
                &provider.model_name,
                None,
            )
            .await?;
        {
            let mut state = self.state.lock().unwrap();
            let usage = state.usage.entry(provider.id.clone()).or_default();
            usage.attempts += 1;
            usage.last_used_at = Some(now_ms());
        }

        let body = build_request_body(&provider.model_name, messages, tools);
        let started = Instant::now();
        let timeout = Duration::from_millis(self.cfg.request_timeout_ms);
        let reply = self
            .transport
            .post_chat(&provider.endpoint, api_key, &body, timeout)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                let msg = sanitize_error(&e.to_string());
                warn!(provider = %provider.id, error = %msg, "transport failure");
                self.note_failure(provider, &msg, None, latency_ms, session_id, directive)
                    .await?;
                return Ok(Attempt::Failed);
            }
        };

        if reply.status == 429 {
            return self
                .handle_rate_limit(provider, &reply, latency_ms, session_id, directive)
                .await;
        }

        if !(200..300).contains(&reply.status) {
            let msg = format!("provider returned HTTP {}", reply.status);
            self.note_failure(
                provider,
                &msg,
                Some(reply.status),
                latency_ms,
                session_id,
                directive,
            )
            .await?;
            return Ok(Attempt::Failed);
        }

        let message = parse_assistant_message(&reply.body, provider);
        match message {
            Some(msg) if !msg.is_empty() => {
                let (req_tokens, resp_tokens) = parse_token_usage(&reply.body);
                {
                    let mut state = self.state.lock().unwrap();
                    let usage = state.usage.entry(provider.id.clone()).or_default();
                    usage.successes += 1;
                    usage.cooldown_until_ms = None;
                    usage.cooldown_reason = None;
                    usage.last_error = None;
                    state.consecutive_failures = 0;
                    state.current_model_id = Some(provider.model_name.clone());
                }
                self.telemetry
                    .emit(
                        RoutingEventKind::Success,
                        &provider.id,
                        &provider.model_name,
                        None,
                    )
                    .await?;
                self.budget
                    .record_usage(UsageSample {
                        session_id: session_id.to_string(),
                        provider_id: provider.id.clone(),
                        model_id: provider.model_name.clone(),
                        profile: directive.profile,
                        stage: UsageStage::Success,
                        request_tokens: req_tokens,
                        response_tokens: resp_tokens,
                        latency_ms,
                        status_code: Some(reply.status),
                        error: None,
                    })
                    .await?;
                Ok(Attempt::Success(msg))
            }
            _ => {
                let msg = "provider returned an empty assistant message";
                self.note_failure(
                    provider,
                    msg,
                    Some(reply.status),
                    latency_ms,
                    session_id,
                    directive,
                )
                .await?;
                Ok(Attempt::Failed)
            }
        }
    }

    async fn handle_rate_limit(
        &self,
        provider: &ProviderConfig,
        reply: &TransportReply,
        latency_ms: u64,
        session_id: &str,
        directive: &RoutingDirective,
    ) -> Result<Attempt> {
        let parsed = reply.retry_after.as_deref().and_then(parse_retry_after);
        let cooldown = parsed
            .unwrap_or(Duration::from_millis(self.cfg.default_rate_limit_cooldown_ms))
            .max(MIN_COOLDOWN);
        let until = now_ms() + cooldown.as_millis() as i64;

        {
            let mut state = self.state.lock().unwrap();
            let usage = state.usage.entry(provider.id.clone()).or_default();
            usage.failures += 1;
            usage.rate_limits += 1;
            usage.last_error = Some("rate limited (429)".into());
            usage.cooldown_until_ms = Some(until);
            usage.cooldown_reason = Some("rate_limit".into());
            state.consecutive_failures += 1;
        }
        self.telemetry
            .emit(
                RoutingEventKind::RateLimit,
                &provider.id,
                &provider.model_name,
                reply.retry_after.clone(),
            )
            .await?;
        self.telemetry
            .emit(
                RoutingEventKind::CooldownSet,
                &provider.id,
                &provider.model_name,
                Some(format!("{}ms", cooldown.as_millis())),
            )
            .await?;
        self.budget
            .apply_provider_cooldown(&provider.id, session_id, "rate_limit")
            .await?;
        self.budget
            .record_usage(UsageSample {
                session_id: session_id.to_string(),
                provider_id: provider.id.clone(),
                model_id: provider.model_name.clone(),
                profile: directive.profile,
                stage: UsageStage::Failure,
                request_tokens: 0,
                response_tokens: 0,
                latency_ms,
                status_code: Some(429),
                error: Some("rate limited".into()),
            })
            .await?;
        Ok(Attempt::RateLimited { wait: cooldown })
    }

    async fn note_failure(
        &self,
        provider: &ProviderConfig,
        message: &str,
        status: Option<u16>,
        latency_ms: u64,
        session_id: &str,
        directive: &RoutingDirective,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let usage = state.usage.entry(provider.id.clone()).or_default();
            usage.failures += 1;
            usage.last_error = Some(message.to_string());
            state.consecutive_failures += 1;
        }
        self.telemetry
            .emit(
                RoutingEventKind::Failure,
                &provider.id,
                &provider.model_name,
                Some(message.to_string()),
            )
            .await?;
        self.budget
            .record_usage(UsageSample {
                session_id: session_id.to_string(),
                provider_id: provider.id.clone(),
                model_id: provider.model_name.clone(),
                profile: directive.profile,
                stage: UsageStage::Failure,
                request_tokens: 0,
                response_tokens: 0,
                latency_ms,
                status_code: status,
                error: Some(message.to_string()),
            })
            .await
    }

    async fn persist_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO model_routing_settings (key, value, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                    params![key, value, now_ms()],
                )?;
                Ok(())
            })
            .await
    }
}

enum Attempt {
    Success(AssistantMessage),
    RateLimited { wait: Duration },
    Failed,
}

fn build_request_body(model: &str, messages: &[ChatMessage], tools: &[ToolSchema]) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
        body["tool_choice"] = Value::String("auto".into());
    }
    body
}

fn parse_assistant_message(body: &Value, provider: &ProviderConfig) -> Option<AssistantMessage> {
    let message = body.get("choices")?.get(0)?.get("message")?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);
    let tool_calls: Vec<ToolCallPayload> = message
        .get("tool_calls")
        .and_then(|tc| serde_json::from_value(tc.clone()).ok())
        .unwrap_or_default();
    Some(AssistantMessage {
        content,
        tool_calls,
        provider_id: provider.id.clone(),
        model_id: provider.model_name.clone(),
    })
}

fn parse_token_usage(body: &Value) -> (u64, u64) {
    let usage = body.get("usage");
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (prompt, completion)
}

/// Scrub credential-shaped substrings from an error message before it is
/// persisted or surfaced.
pub(crate) fn sanitize_error(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for token in message.split_whitespace() {
        let redacted = if token.starts_with("sk-")
            || token.starts_with("Bearer")
            || token.starts_with("bearer")
            || token.to_ascii_lowercase().contains("api_key=")
            || token.to_ascii_lowercase().contains("api-key=")
        {
            "[redacted]"
        } else {
            token
        };
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(redacted);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;
    use moray_config::BudgetConfig;

    fn providers() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig {
                id: "primary".into(),
                model_name: "model-a".into(),
                endpoint: "http://primary/v1/chat/completions".into(),
                api_key_name: "MORAY_TEST_KEY_PRIMARY".into(),
                tier: ProviderTier::Standard,
            },
            ProviderConfig {
                id: "fallback_1".into(),
                model_name: "model-b".into(),
                endpoint: "http://fallback1/v1/chat/completions".into(),
                api_key_name: "MORAY_TEST_KEY_FB1".into(),
                tier: ProviderTier::Standard,
            },
            ProviderConfig {
                id: "fallback_2".into(),
                model_name: "model-c".into(),
                endpoint: "http://fallback2/v1/chat/completions".into(),
                api_key_name: "MORAY_TEST_KEY_FB2".into(),
                tier: ProviderTier::Economy,
            },
        ]
    }

    fn set_keys() {
        std::env::set_var("MORAY_TEST_KEY_PRIMARY", "k1");
        std::env::set_var("MORAY_TEST_KEY_FB1", "k2");
        std::env::set_var("MORAY_TEST_KEY_FB2", "k3");
    }

    async fn router_with(
        replies: Vec<anyhow::Result<TransportReply>>,
        cfg: RouterConfig,
        budget_cfg: BudgetConfig,
    ) -> (tempfile::TempDir, Arc<ScriptedTransport>, ModelRouter) {
        set_keys();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("router.db")).await.unwrap();
        let budget = Arc::new(BudgetGovernor::new(
            store.clone(),
            budget_cfg,
            &providers(),
        ));
        let transport = Arc::new(ScriptedTransport::new(replies));
        let router = ModelRouter::new(
            store,
            cfg,
            providers(),
            budget,
            transport.clone() as Arc<dyn ChatTransport>,
        )
        .await
        .unwrap();
        (dir, transport, router)
    }

    fn fast_cfg(mode: &str) -> RouterConfig {
        RouterConfig {
            default_rate_limit_cooldown_ms: 1_000,
            intelligent_pacing_max_wait_ms: 1_000,
            fallback_mode: mode.into(),
            ..RouterConfig::default()
        }
    }

    #[tokio::test]
    async fn rate_limit_fails_over_to_next_provider() {
        let (_d, transport, router) = router_with(
            vec![
                Ok(TransportReply::rate_limited("1")),
                Ok(TransportReply::text("ok")),
            ],
            fast_cfg("aggressive_fallback"),
            BudgetConfig::default(),
        )
        .await;

        let msg = router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        assert_eq!(msg.content.as_deref(), Some("ok"));
        assert_eq!(msg.provider_id, "fallback_1");
        assert_eq!(
            transport.endpoints(),
            vec![
                "http://primary/v1/chat/completions",
                "http://fallback1/v1/chat/completions"
            ]
        );

        let health = router.health_snapshot();
        assert!(health.failover_count >= 1);
        let primary = &health
            .providers
            .iter()
            .find(|(id, _)| id == "primary")
            .unwrap()
            .1;
        assert!(primary.cooldown_until_ms.unwrap() > now_ms());
        assert_eq!(primary.rate_limits, 1);
        assert_eq!(router.count_events(RoutingEventKind::RateLimit), 1);
    }

    #[tokio::test]
    async fn rate_limit_records_budget_cooldown() {
        let (_d, _t, router) = router_with(
            vec![
                Ok(TransportReply::rate_limited("1")),
                Ok(TransportReply::text("ok")),
            ],
            fast_cfg("aggressive_fallback"),
            BudgetConfig::default(),
        )
        .await;
        router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        // Budget governor must now block the rate-limited provider.
        let directive = router.budget().routing_directive("s1").await.unwrap();
        assert_eq!(directive.blocked_providers, vec!["primary".to_string()]);
    }

    #[tokio::test]
    async fn intelligent_pacing_retries_same_provider() {
        let (_d, transport, router) = router_with(
            vec![
                Ok(TransportReply::rate_limited("1")),
                Ok(TransportReply::text("recovered")),
            ],
            fast_cfg("intelligent_pacing"),
            BudgetConfig::default(),
        )
        .await;

        let msg = router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        assert_eq!(msg.content.as_deref(), Some("recovered"));
        assert_eq!(
            transport.endpoints(),
            vec![
                "http://primary/v1/chat/completions",
                "http://primary/v1/chat/completions"
            ],
            "both calls must target the primary"
        );
        assert_eq!(router.health_snapshot().failover_count, 0);
        assert_eq!(router.count_events(RoutingEventKind::CooldownWait), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_typed_error() {
        let (_d, _t, router) = router_with(
            vec![
                Ok(TransportReply::status(500)),
                Ok(TransportReply::status(500)),
                Ok(TransportReply::status(502)),
            ],
            fast_cfg("aggressive_fallback"),
            BudgetConfig::default(),
        )
        .await;
        let err = router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap_err();
        match err {
            RouterError::AllProvidersExhausted { tried, .. } => assert_eq!(tried, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(router.health_snapshot().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn empty_choice_message_is_a_failure() {
        let empty = TransportReply {
            status: 200,
            retry_after: None,
            body: serde_json::json!({ "choices": [{ "message": { "content": "" } }] }),
        };
        let (_d, _t, router) = router_with(
            vec![Ok(empty), Ok(TransportReply::text("backup"))],
            fast_cfg("aggressive_fallback"),
            BudgetConfig::default(),
        )
        .await;
        let msg = router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        assert_eq!(msg.provider_id, "fallback_1");
        assert_eq!(msg.content.as_deref(), Some("backup"));
    }

    #[tokio::test]
    async fn hard_limit_directive_skips_blocked_primary() {
        // Limit 2, spend 3 → hard_limit; primary's model gets blocked.
        let budget_cfg = BudgetConfig {
            daily_request_limit: 2,
            ..BudgetConfig::default()
        };
        let (_d, transport, router) = router_with(
            vec![
                Ok(TransportReply::text("one")),
                Ok(TransportReply::text("two")),
                Ok(TransportReply::text("three")),
                Ok(TransportReply::text("after limit")),
            ],
            fast_cfg("aggressive_fallback"),
            budget_cfg,
        )
        .await;
        for _ in 0..3 {
            router
                .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
                .await
                .unwrap();
        }
        let msg = router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        // Economy ordering puts the economy-tier provider first; primary is
        // blocked either way and must never be called.
        assert_ne!(msg.provider_id, "primary");
        assert!(transport
            .endpoints()
            .iter()
            .skip(3)
            .all(|e| !e.contains("primary")));
        assert!(router.count_events(RoutingEventKind::CooldownSkip) >= 1);
    }

    #[tokio::test]
    async fn force_failover_rotates_and_reset_restores() {
        let (_d, transport, router) = router_with(
            vec![
                Ok(TransportReply::text("a")),
                Ok(TransportReply::text("b")),
            ],
            fast_cfg("aggressive_fallback"),
            BudgetConfig::default(),
        )
        .await;
        router.force_failover().await.unwrap();
        router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        assert_eq!(
            transport.endpoints()[0],
            "http://fallback1/v1/chat/completions",
            "rotated head must lead the preferred order"
        );
        router.reset_preferred_model().await.unwrap();
        router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        assert_eq!(
            transport.endpoints()[1],
            "http://primary/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn mode_change_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("mode.db")).await.unwrap();
        set_keys();
        let budget = Arc::new(BudgetGovernor::new(
            store.clone(),
            BudgetConfig::default(),
            &providers(),
        ));
        let transport: Arc<dyn ChatTransport> = Arc::new(ScriptedTransport::new(vec![]));
        let router = ModelRouter::new(
            store.clone(),
            RouterConfig::default(),
            providers(),
            budget.clone(),
            transport.clone(),
        )
        .await
        .unwrap();
        router
            .set_fallback_mode(FallbackMode::AggressiveFallback)
            .await
            .unwrap();

        // A second router over the same store inherits the persisted mode.
        let router2 = ModelRouter::new(store, RouterConfig::default(), providers(), budget, transport)
            .await
            .unwrap();
        assert_eq!(router2.fallback_mode(), FallbackMode::AggressiveFallback);
    }

    #[tokio::test]
    async fn transport_error_is_sanitized() {
        let (_d, _t, router) = router_with(
            vec![
                Err(anyhow::anyhow!("connect failed with key sk-abc123secret")),
                Ok(TransportReply::text("ok")),
            ],
            fast_cfg("aggressive_fallback"),
            BudgetConfig::default(),
        )
        .await;
        router
            .create_chat_completion(&[ChatMessage::user("hi")], &[], "s1")
            .await
            .unwrap();
        let health = router.health_snapshot();
        let primary = &health
            .providers
            .iter()
            .find(|(id, _)| id == "primary")
            .unwrap()
            .1;
        let err = primary.last_error.as_deref().unwrap();
        assert!(!err.contains("sk-abc123secret"));
        assert!(err.contains("[redacted]"));
    }

    #[test]
    fn sanitize_error_redacts_key_shapes() {
        assert_eq!(
            sanitize_error("auth failed for sk-live-123"),
            "auth failed for [redacted]"
        );
        assert_eq!(sanitize_error("plain message"), "plain message");
    }

    #[test]
    fn request_body_includes_tools_only_when_present() {
        let body = build_request_body("m", &[ChatMessage::user("x")], &[]);
        assert!(body.get("tools").is_none());
        let tools = vec![ToolSchema {
            name: "t".into(),
            description: "d".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let body = build_request_body("m", &[ChatMessage::user("x")], &tools);
        assert_eq!(body["tools"][0]["function"]["name"], "t");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn fallback_mode_parse_rejects_unknown() {
        assert_eq!(FallbackMode::parse("intelligent_pacing"), Some(FallbackMode::IntelligentPacing));
        assert_eq!(FallbackMode::parse("aggressive_fallback"), Some(FallbackMode::AggressiveFallback));
        assert_eq!(FallbackMode::parse("yolo"), None);
    }
}
