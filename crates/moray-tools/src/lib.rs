// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool dispatch for the conversation gateway.
//!
//! An assistant turn's tool calls are executed by the [`LaneExecutor`]
//! strictly serially, in order — a *lane*.  Each call passes the capability
//! scope gate (for MCP-provided tools) and the [`PolicyEngine`] before its
//! executor runs; denials come back as tool-role turns so the conversation
//! can recover.

pub mod builtin;
mod lane;
mod policy;
mod registry;
mod tool;

pub use lane::{LaneExecutor, ScopeAudit, ToolTurn};
pub use policy::{PolicyAction, PolicyDecision, PolicyEngine, PolicyProfile, PolicyRule};
pub use registry::{ToolRegistry, ToolSchemaInfo};
pub use tool::{LaneCall, Tool, ToolScope, ToolSource};
