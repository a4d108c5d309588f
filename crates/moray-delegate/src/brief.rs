// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Resource limits attached to one brief.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefConstraints {
    /// Tool calls the sub-agent may spend.
    pub tool_budget: u32,
    /// Per-job wall-clock cap; `None` uses the configured default.
    pub timeout_ms: Option<u64>,
    /// Model round cap for the sub-agent conversation.
    pub max_turns: u32,
}

impl Default for BriefConstraints {
    fn default() -> Self {
        Self {
            tool_budget: 4,
            timeout_ms: None,
            max_turns: 3,
        }
    }
}

/// One sub-agent task description in a delegation DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationBrief {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub scoped_context: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub constraints: BriefConstraints,
}

impl DelegationBrief {
    /// Minimal brief for tests and simple callers.
    pub fn new(id: impl Into<String>, title: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            title: title.into(),
            objective: objective.into(),
            scoped_context: String::new(),
            expected_output: String::new(),
            constraints: BriefConstraints::default(),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// A delegation run request.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub session_id: String,
    /// The user message that triggered delegation.
    pub parent_message: String,
    /// Free-form scope note forwarded to every sub-agent.
    pub scope: String,
    pub briefs: Vec<DelegationBrief>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("brief '{brief}' depends on unknown brief '{dependency}'")]
    MissingDependency { brief: String, dependency: String },
    #[error("dependency cycle detected involving brief '{at}'")]
    CycleDetected { at: String },
    #[error("duplicate brief id '{id}'")]
    DuplicateId { id: String },
}

/// Validate the brief set before anything runs: every dependency must
/// resolve, ids must be unique, and the graph must be acyclic.
pub fn validate_dag(briefs: &[DelegationBrief]) -> Result<(), DagError> {
    let mut ids = HashSet::new();
    for brief in briefs {
        if !ids.insert(brief.id.as_str()) {
            return Err(DagError::DuplicateId {
                id: brief.id.clone(),
            });
        }
    }
    for brief in briefs {
        for dep in &brief.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(DagError::MissingDependency {
                    brief: brief.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm: anything left unprocessed sits on a cycle.
    let mut in_degree: HashMap<&str, usize> = briefs
        .iter()
        .map(|b| (b.id.as_str(), b.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for brief in briefs {
        for dep in &brief.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(brief.id.as_str());
        }
    }
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0usize;
    while let Some(id) = ready.pop() {
        processed += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            let d = in_degree.get_mut(dependent).unwrap();
            *d -= 1;
            if *d == 0 {
                ready.push(dependent);
            }
        }
    }
    if processed != briefs.len() {
        let stuck = in_degree
            .iter()
            .find(|(_, d)| **d > 0)
            .map(|(id, _)| id.to_string())
            .unwrap_or_default();
        return Err(DagError::CycleDetected { at: stuck });
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dag_is_valid() {
        assert!(validate_dag(&[]).is_ok());
    }

    #[test]
    fn linear_chain_is_valid() {
        let briefs = vec![
            DelegationBrief::new("a", "A", "do a"),
            DelegationBrief::new("b", "B", "do b").depends_on(&["a"]),
            DelegationBrief::new("c", "C", "do c").depends_on(&["b"]),
        ];
        assert!(validate_dag(&briefs).is_ok());
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let briefs = vec![DelegationBrief::new("a", "A", "do a").depends_on(&["ghost"])];
        assert_eq!(
            validate_dag(&briefs),
            Err(DagError::MissingDependency {
                brief: "a".into(),
                dependency: "ghost".into(),
            })
        );
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let briefs = vec![
            DelegationBrief::new("a", "A", "do a").depends_on(&["b"]),
            DelegationBrief::new("b", "B", "do b").depends_on(&["a"]),
        ];
        assert!(matches!(
            validate_dag(&briefs),
            Err(DagError::CycleDetected { .. })
        ));
    }

    #[test]
    fn self_cycle_is_rejected() {
        let briefs = vec![DelegationBrief::new("a", "A", "do a").depends_on(&["a"])];
        assert!(matches!(
            validate_dag(&briefs),
            Err(DagError::CycleDetected { .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let briefs = vec![
            DelegationBrief::new("a", "A", "one"),
            DelegationBrief::new("a", "A2", "two"),
        ];
        assert_eq!(
            validate_dag(&briefs),
            Err(DagError::DuplicateId { id: "a".into() })
        );
    }

    #[test]
    fn diamond_is_valid() {
        let briefs = vec![
            DelegationBrief::new("root", "R", "r"),
            DelegationBrief::new("left", "L", "l").depends_on(&["root"]),
            DelegationBrief::new("right", "R2", "r2").depends_on(&["root"]),
            DelegationBrief::new("join", "J", "j").depends_on(&["left", "right"]),
        ];
        assert!(validate_dag(&briefs).is_ok());
    }
}
