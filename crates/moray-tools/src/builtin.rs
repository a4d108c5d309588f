// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Builtin tools shipped with the gateway binary.  The interesting tool
//! surface arrives from MCP servers at runtime; these cover the basics a
//! bare install still wants.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::Tool;

/// Current date and time in UTC (RFC 3339).
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }
    fn description(&self) -> &str {
        "Returns the current UTC date and time in RFC 3339 format."
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(&self, _args: Value) -> anyhow::Result<Value> {
        Ok(json!(chrono::Utc::now().to_rfc3339()))
    }
}

/// Arithmetic on two operands; the model keeps trying to do this in its
/// head otherwise.
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }
    fn description(&self) -> &str {
        "Evaluates a basic arithmetic operation: {op: add|sub|mul|div, a, b}."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "op": { "type": "string", "enum": ["add", "sub", "mul", "div"] },
                "a": { "type": "number" },
                "b": { "type": "number" }
            },
            "required": ["op", "a", "b"]
        })
    }
    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let op = args["op"].as_str().unwrap_or("");
        let a = args["a"].as_f64().unwrap_or(f64::NAN);
        let b = args["b"].as_f64().unwrap_or(f64::NAN);
        let result = match op {
            "add" => a + b,
            "sub" => a - b,
            "mul" => a * b,
            "div" => {
                if b == 0.0 {
                    anyhow::bail!("division by zero");
                }
                a / b
            }
            other => anyhow::bail!("unknown operation '{other}'"),
        };
        if result.is_nan() {
            anyhow::bail!("operands must be numbers");
        }
        Ok(json!(result))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
