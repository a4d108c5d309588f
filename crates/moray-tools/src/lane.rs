// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{LaneCall, PolicyAction, PolicyEngine, Tool, ToolRegistry, ToolScope, ToolSource};

/// The tool-role turn produced for one lane call.
#[derive(Debug, Clone)]
pub struct ToolTurn {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

/// One scope-gate verdict, kept for audit.
#[derive(Debug, Clone)]
pub struct ScopeAudit {
    pub session_id: String,
    pub tool_name: String,
    pub scope: ToolScope,
    pub allowed: bool,
    pub reason: String,
    pub created_at: i64,
}

/// Serial executor for the tool calls of one assistant turn.
///
/// No parallelism by design: calls run in the order the model emitted them,
/// each one gated by capability scope and policy before its executor runs.
pub struct LaneExecutor {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    /// Ambient per-call execution cap.
    timeout: Duration,
    audits: Mutex<Vec<ScopeAudit>>,
}

impl LaneExecutor {
    pub fn new(registry: Arc<ToolRegistry>, policy: Arc<PolicyEngine>, timeout: Duration) -> Self {
        Self {
            registry,
            policy,
            timeout,
            audits: Mutex::new(Vec::new()),
        }
    }

    /// Execute `calls` serially; always returns one turn per call.
    pub async fn run_lane(&self, session_id: &str, calls: &[LaneCall]) -> Vec<ToolTurn> {
        let mut turns = Vec::with_capacity(calls.len());
        for call in calls {
            turns.push(self.run_one(session_id, call).await);
        }
        turns
    }

    async fn run_one(&self, session_id: &str, call: &LaneCall) -> ToolTurn {
        // Invalid JSON arguments degrade to an empty object rather than
        // failing the call; the tool's own schema validation takes it from there.
        let args: Value =
            serde_json::from_str(&call.arguments).unwrap_or_else(|_| Value::Object(Default::default()));

        let Some(tool) = self.registry.resolve(&call.name) else {
            return ToolTurn {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: format!(
                    "Error: Tool '{}' is not registered or unavailable.",
                    call.name
                ),
                is_error: true,
            };
        };

        if let ToolSource::Mcp { scope } = tool.source() {
            if let Some(denial) = self.scope_gate(session_id, &call.name, scope) {
                return ToolTurn {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: denial,
                    is_error: true,
                };
            }
        }

        let decision = self.policy.evaluate(session_id, &call.name);
        if decision.action == PolicyAction::Deny {
            debug!(tool = %call.name, profile = %decision.profile_id, "policy denied tool call");
            return ToolTurn {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: format!(
                    "Access Denied: tool '{}' is not permitted. Reason: {}",
                    call.name, decision.reason
                ),
                is_error: true,
            };
        }

        match tokio::time::timeout(self.timeout, tool.execute(args)).await {
            Ok(Ok(output)) => ToolTurn {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: render_output(output),
                is_error: false,
            },
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "tool execution failed");
                ToolTurn {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: format!("Error executing tool: {}", sanitize(&e.to_string())),
                    is_error: true,
                }
            }
            Err(_) => ToolTurn {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: format!(
                    "Error executing tool: timed out after {}ms",
                    self.timeout.as_millis()
                ),
                is_error: true,
            },
        }
    }

    /// Capability gate for MCP tools.  Returns the denial message, or `None`
    /// when the call may proceed.  Every verdict lands in the audit trail.
    fn scope_gate(&self, session_id: &str, tool_name: &str, scope: ToolScope) -> Option<String> {
        let (allowed, reason) = match scope {
            ToolScope::Unclassified => (
                false,
                "unclassified MCP tools are denied by secure default".to_string(),
            ),
            ToolScope::HighRisk => {
                if self.policy.has_explicit_allow(session_id, tool_name) {
                    (true, "high-risk scope with explicit allow rule".to_string())
                } else {
                    (
                        false,
                        "high-risk scope requires an explicit policy allow rule".to_string(),
                    )
                }
            }
            ToolScope::ReadOnly | ToolScope::WriteLimited => {
                (true, format!("{} scope allowed by default", scope.as_str()))
            }
        };
        self.audits.lock().unwrap().push(ScopeAudit {
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            scope,
            allowed,
            reason: reason.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        });
        if allowed {
            None
        } else {
            Some(format!(
                "Access Denied: tool '{tool_name}' ({} scope). Reason: {reason}",
                scope.as_str()
            ))
        }
    }

    /// Scope-gate audit entries recorded so far, oldest first.
    pub fn audits(&self) -> Vec<ScopeAudit> {
        self.audits.lock().unwrap().clone()
    }
}

fn render_output(output: Value) -> String {
    match output {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Strip credential-shaped tokens from error text.
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
