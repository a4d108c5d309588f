// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic context compaction.
//!
//! The composed system prompt has four tiers — persona, hot window, warm
//! summary, archive summary — each with its own token budget.  A tier over
//! budget is compacted without a model call: provenance-labeled lines
//! (`[#12] …`) are always kept, the rest is truncated head-first.  The
//! caller tracks how often compaction fires; a sustained streak marks the
//! session degraded for the incident manager.

use moray_config::ContextBudgets;
use moray_model::{ChatMessage, Role};
use regex::Regex;
use std::sync::OnceLock;

/// chars/4 — the same approximation the rest of the pipeline uses.
fn approx_tokens(text: &str) -> usize {
    text.len() / 4
}

fn provenance_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[#\d+\]").unwrap())
}

/// Compact one text segment to roughly `max_tokens`.
///
/// Returns `(text, compacted)`.  Lines carrying a `[#n]` provenance label
/// survive compaction verbatim; unlabeled lines fill the remaining budget in
/// order, and a marker line records the cut.
pub fn compact_segment(text: &str, max_tokens: usize) -> (String, bool) {
    if approx_tokens(text) <= max_tokens {
        return (text.to_string(), false);
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut budget = max_tokens.saturating_mul(4);
    let mut dropped = 0usize;

    // Pass 1: labeled lines are load-bearing; keep them all.
    for line in text.lines() {
        if provenance_regex().is_match(line) {
            kept.push(line);
            budget = budget.saturating_sub(line.len());
        }
    }
    // Pass 2: unlabeled lines fill what is left, head-first.
    for line in text.lines() {
        if provenance_regex().is_match(line) {
            continue;
        }
        if line.len() <= budget {
            kept.push(line);
            budget -= line.len();
        } else {
            dropped += 1;
        }
    }

    let mut result = kept.join("\n");
    if dropped > 0 {
        result.push_str(&format!("\n… ({dropped} lines compacted)"));
    }
    (result, true)
}

/// The assembled system prompt plus whether any tier was compacted.
#[derive(Debug, Clone)]
pub struct ComposedContext {
    pub system_prompt: String,
    pub compacted: bool,
}

/// Compose the tiered system prompt:
/// persona → memory context → delegation report → warm/archive summaries.
/// The hot window (recent turns) stays in the message list itself; its
/// overflow is summarized into the warm tier here.
pub fn compose_context(
    persona: &str,
    memory_block: &str,
    delegation_report: Option<&str>,
    older_turns: &[ChatMessage],
    budgets: &ContextBudgets,
) -> ComposedContext {
    let mut compacted = false;
    let mut sections: Vec<String> = Vec::new();

    let (persona_text, c) = compact_segment(persona, budgets.system_tokens);
    compacted |= c;
    if !persona_text.is_empty() {
        sections.push(persona_text);
    }

    if !memory_block.is_empty() {
        let (memory_text, c) = compact_segment(memory_block, budgets.hot_window_tokens);
        compacted |= c;
        sections.push(format!("Relevant memory:\n{memory_text}"));
    }

    if let Some(report) = delegation_report {
        let (report_text, c) = compact_segment(report, budgets.warm_summary_tokens);
        compacted |= c;
        sections.push(format!("Delegated work report:\n{report_text}"));
    }

    if !older_turns.is_empty() {
        let (warm, archive) = split_tiers(older_turns);
        if !warm.is_empty() {
            let summary = summarize_turns(&warm);
            let (warm_text, c) = compact_segment(&summary, budgets.warm_summary_tokens);
            compacted |= c;
            sections.push(format!("Earlier in this conversation:\n{warm_text}"));
        }
        if !archive.is_empty() {
            let summary = summarize_turns(&archive);
            let (archive_text, c) = compact_segment(&summary, budgets.archive_summary_tokens);
            compacted |= c;
            sections.push(format!("Archived context:\n{archive_text}"));
        }
    }

    ComposedContext {
        system_prompt: sections.join("\n\n"),
        compacted,
    }
}

/// Older turns split into warm (newer half) and archive (older half).
fn split_tiers(turns: &[ChatMessage]) -> (Vec<&ChatMessage>, Vec<&ChatMessage>) {
    let mid = turns.len() / 2;
    let archive = turns[..mid].iter().collect();
    let warm = turns[mid..].iter().collect();
    (warm, archive)
}

/// One line per turn: role and first line of content.
fn summarize_turns(turns: &[&ChatMessage]) -> String {
    turns
        .iter()
        .filter(|t| !matches!(t.role, Role::System))
        .map(|t| {
            let first = t.content.lines().next().unwrap_or("");
            format!("- {}: {}", t.role.as_str(), first)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
