// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use moray_config::{PolicyConfig, PolicyProfileConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A rule's (or profile default's) verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
    /// Defer to the next evaluation layer.  Only meaningful as a profile
    /// default; a terminal `fallback` resolves to allow.
    Fallback,
}

impl PolicyAction {
    fn parse(s: &str) -> Self {
        match s {
            "deny" => Self::Deny,
            "fallback" => Self::Fallback,
            _ => Self::Allow,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Tool name, or `*` to match any tool.
    pub skill_name: String,
    pub action: PolicyAction,
    pub reason: Option<String>,
}

impl PolicyRule {
    fn matches(&self, tool_name: &str) -> bool {
        self.skill_name == "*" || self.skill_name == tool_name
    }
}

#[derive(Debug, Clone)]
pub struct PolicyProfile {
    pub id: String,
    pub default_action: PolicyAction,
    pub rules: Vec<PolicyRule>,
}

impl PolicyProfile {
    fn from_config(cfg: &PolicyProfileConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            default_action: PolicyAction::parse(&cfg.default_action),
            rules: cfg
                .rules
                .iter()
                .map(|r| PolicyRule {
                    skill_name: r.skill_name.clone(),
                    action: PolicyAction::parse(&r.action),
                    reason: r.reason.clone(),
                })
                .collect(),
        }
    }
}

/// The engine's verdict for one `(session, tool)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason: String,
    /// Profile that produced the verdict.
    pub profile_id: String,
}

type DecisionHook = Box<dyn Fn(&PolicyDecision) -> anyhow::Result<()> + Send + Sync>;

/// Layered allow/deny evaluation:
/// session-override rules → session default (unless `fallback`) →
/// global rules → global default.
pub struct PolicyEngine {
    global: PolicyProfile,
    session_overrides: HashMap<String, PolicyProfile>,
    on_decision: Option<DecisionHook>,
}

impl PolicyEngine {
    pub fn from_config(cfg: &PolicyConfig) -> Self {
        Self {
            global: PolicyProfile::from_config(&cfg.global),
            session_overrides: cfg
                .session_overrides
                .iter()
                .map(|(k, v)| (k.clone(), PolicyProfile::from_config(v)))
                .collect(),
            on_decision: None,
        }
    }

    /// Install a hook invoked with every decision.  Hook errors are logged
    /// and never change the verdict.
    pub fn with_hook(
        mut self,
        hook: impl Fn(&PolicyDecision) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_decision = Some(Box::new(hook));
        self
    }

    pub fn evaluate(&self, session_id: &str, tool_name: &str) -> PolicyDecision {
        let decision = self.evaluate_inner(session_id, tool_name);
        if let Some(hook) = &self.on_decision {
            if let Err(e) = hook(&decision) {
                warn!(error = %e, tool = %tool_name, "policy decision hook failed");
            }
        }
        decision
    }

    fn evaluate_inner(&self, session_id: &str, tool_name: &str) -> PolicyDecision {
        if let Some(profile) = self.session_overrides.get(session_id) {
            if let Some(rule) = profile.rules.iter().find(|r| r.matches(tool_name)) {
                return decision_from_rule(rule, profile);
            }
            if profile.default_action != PolicyAction::Fallback {
                return decision_from_default(profile);
            }
        }
        if let Some(rule) = self.global.rules.iter().find(|r| r.matches(tool_name)) {
            return decision_from_rule(rule, &self.global);
        }
        decision_from_default(&self.global)
    }

    /// True when an *explicit* allow rule (not a profile default) covers
    /// `(session, tool)`.  High-risk scoped tools require this.
    pub fn has_explicit_allow(&self, session_id: &str, tool_name: &str) -> bool {
        let rule_allows = |profile: &PolicyProfile| {
            profile
                .rules
                .iter()
                .find(|r| r.matches(tool_name))
                .map(|r| r.action == PolicyAction::Allow)
        };
        if let Some(profile) = self.session_overrides.get(session_id) {
            if let Some(allowed) = rule_allows(profile) {
                return allowed;
            }
        }
        rule_allows(&self.global).unwrap_or(false)
    }
}

fn decision_from_rule(rule: &PolicyRule, profile: &PolicyProfile) -> PolicyDecision {
    let action = match rule.action {
        PolicyAction::Fallback => PolicyAction::Allow,
        other => other,
    };
    PolicyDecision {
        action,
        reason: rule
            .reason
            .clone()
            .unwrap_or_else(|| format!("rule '{}' in profile '{}'", rule.skill_name, profile.id)),
        profile_id: profile.id.clone(),
    }
}

fn decision_from_default(profile: &PolicyProfile) -> PolicyDecision {
    let action = match profile.default_action {
        // A terminal fallback has nowhere left to defer; resolve open.
        PolicyAction::Fallback => PolicyAction::Allow,
        other => other,
    };
    PolicyDecision {
        action,
        reason: format!("default of profile '{}'", profile.id),
        profile_id: profile.id.clone(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use moray_config::PolicyRuleConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn profile(id: &str, default: &str, rules: Vec<(&str, &str, Option<&str>)>) -> PolicyProfileConfig {
        PolicyProfileConfig {
            id: id.into(),
            default_action: default.into(),
            rules: rules
                .into_iter()
                .map(|(name, action, reason)| PolicyRuleConfig {
                    skill_name: name.into(),
                    action: action.into(),
                    reason: reason.map(str::to_string),
                })
                .collect(),
        }
    }

    fn engine(global: PolicyProfileConfig, overrides: Vec<(&str, PolicyProfileConfig)>) -> PolicyEngine {
        let cfg = PolicyConfig {
            global,
            session_overrides: overrides
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };
        PolicyEngine::from_config(&cfg)
    }

    #[test]
    fn global_default_allow_applies() {
        let e = engine(profile("g", "allow", vec![]), vec![]);
        let d = e.evaluate("s1", "anything");
        assert_eq!(d.action, PolicyAction::Allow);
        assert_eq!(d.profile_id, "g");
    }

    #[test]
    fn global_rule_beats_global_default() {
        let e = engine(
            profile("g", "allow", vec![("shell", "deny", Some("no shell"))]),
            vec![],
        );
        let d = e.evaluate("s1", "shell");
        assert_eq!(d.action, PolicyAction::Deny);
        assert_eq!(d.reason, "no shell");
    }

    #[test]
    fn session_rule_beats_global_rule() {
        let e = engine(
            profile("g", "allow", vec![("shell", "deny", None)]),
            vec![("s1", profile("s1p", "fallback", vec![("shell", "allow", None)]))],
        );
        assert_eq!(e.evaluate("s1", "shell").action, PolicyAction::Allow);
        // Other sessions still hit the global rule.
        assert_eq!(e.evaluate("s2", "shell").action, PolicyAction::Deny);
    }

    #[test]
    fn session_default_applies_unless_fallback() {
        let e = engine(
            profile("g", "allow", vec![]),
            vec![("locked", profile("lockdown", "deny", vec![]))],
        );
        assert_eq!(e.evaluate("locked", "anything").action, PolicyAction::Deny);
    }

    #[test]
    fn session_fallback_default_defers_to_global() {
        let e = engine(
            profile("g", "deny", vec![]),
            vec![("s1", profile("s1p", "fallback", vec![]))],
        );
        assert_eq!(e.evaluate("s1", "tool").action, PolicyAction::Deny);
        assert_eq!(e.evaluate("s1", "tool").profile_id, "g");
    }

    #[test]
    fn wildcard_matches_any_tool() {
        let e = engine(
            profile("g", "allow", vec![("*", "deny", Some("lockdown"))]),
            vec![],
        );
        assert_eq!(e.evaluate("s1", "whatever").action, PolicyAction::Deny);
    }

    #[test]
    fn terminal_fallback_resolves_to_allow() {
        let e = engine(profile("g", "fallback", vec![]), vec![]);
        assert_eq!(e.evaluate("s1", "tool").action, PolicyAction::Allow);
    }

    #[test]
    fn explicit_allow_requires_a_rule() {
        let e = engine(profile("g", "allow", vec![]), vec![]);
        assert!(!e.has_explicit_allow("s1", "dangerous"));

        let e = engine(
            profile("g", "allow", vec![("dangerous", "allow", None)]),
            vec![],
        );
        assert!(e.has_explicit_allow("s1", "dangerous"));
    }

    #[test]
    fn session_deny_rule_blocks_explicit_allow_from_global() {
        let e = engine(
            profile("g", "allow", vec![("dangerous", "allow", None)]),
            vec![("s1", profile("p", "fallback", vec![("dangerous", "deny", None)]))],
        );
        assert!(!e.has_explicit_allow("s1", "dangerous"));
        assert!(e.has_explicit_allow("s2", "dangerous"));
    }

    #[test]
    fn hook_is_invoked_and_errors_ignored() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let e = engine(profile("g", "allow", vec![]), vec![]).with_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("hook exploded")
        });
        let d = e.evaluate("s1", "tool");
        assert_eq!(d.action, PolicyAction::Allow, "hook error must not flip verdict");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
