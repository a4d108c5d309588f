// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use std::sync::OnceLock;

/// Keywords whose presence suggests a prompt worth delegating.
pub const DELEGATION_KEYWORDS: &[&str] = &[
    "research",
    "compare",
    "analyze",
    "investigate",
    "plan",
    "summarize",
    "implement",
    "refactor",
];

fn conjunction_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(and|then|after that|while)\b").unwrap())
}

/// Prompt complexity score:
/// +1 when the whitespace token count is ≥ 55,
/// +1 when the prompt contains a sequencing conjunction,
/// +1 per matched delegation keyword.
pub fn complexity_score(text: &str) -> u32 {
    let mut score = 0;
    if text.split_whitespace().count() >= 55 {
        score += 1;
    }
    let lowered = text.to_lowercase();
    if conjunction_regex().is_match(&lowered) {
        score += 1;
    }
    for keyword in DELEGATION_KEYWORDS {
        if lowered.contains(keyword) {
            score += 1;
        }
    }
    score
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_prompt_scores_zero() {
        assert_eq!(complexity_score("hello"), 0);
        assert_eq!(complexity_score("what time is it?"), 0);
    }

    #[test]
    fn conjunction_adds_one() {
        assert_eq!(complexity_score("fetch the logs and the metrics"), 1);
        assert_eq!(complexity_score("do this then do that"), 1);
    }

    #[test]
    fn keyword_adds_one_each() {
        assert_eq!(complexity_score("research this topic"), 1);
        assert_eq!(complexity_score("research the options, compare them"), 2);
    }

    #[test]
    fn long_prompt_adds_one() {
        let long = "word ".repeat(60);
        assert_eq!(complexity_score(&long), 1);
    }

    #[test]
    fn combined_signals_accumulate() {
        let prompt = format!(
            "{} research the failure modes and then summarize the findings",
            "context ".repeat(55)
        );
        // length + conjunction + research + summarize
        assert_eq!(complexity_score(&prompt), 4);
    }

    #[test]
    fn conjunction_requires_word_boundary() {
        // "android" contains "and" but must not count.
        assert_eq!(complexity_score("android update"), 0);
    }
}
