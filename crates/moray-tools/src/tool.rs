// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability class of an MCP-provided tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolScope {
    ReadOnly,
    WriteLimited,
    HighRisk,
    Unclassified,
}

impl ToolScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::WriteLimited => "write-limited",
            Self::HighRisk => "high-risk",
            Self::Unclassified => "unclassified",
        }
    }
}

/// Where a tool comes from.  Builtin tools are trusted code in this process;
/// MCP tools arrive from an external server and carry a capability scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    Mcp { scope: ToolScope },
}

/// One tool call as handed to the lane, arguments still raw.
#[derive(Debug, Clone)]
pub struct LaneCall {
    /// Opaque identifier from the model, echoed on the tool-role turn.
    pub id: String,
    pub name: String,
    /// Raw JSON argument string exactly as the model produced it.
    pub arguments: String,
}

/// Trait every builtin and MCP-bridged tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    fn source(&self) -> ToolSource {
        ToolSource::Builtin
    }
    /// Execute the tool.  Errors are sanitized by the lane before they reach
    /// the conversation.
    async fn execute(&self, args: Value) -> anyhow::Result<Value>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
