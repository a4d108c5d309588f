// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashSet, VecDeque};

use anyhow::Result;
use moray_store::{now_ms, rusqlite::params, Store};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Edge relation between two claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Supports,
    Contradicts,
    DependsOn,
    DerivedFrom,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::DependsOn => "depends_on",
            Self::DerivedFrom => "derived_from",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "supports" => Some(Self::Supports),
            "contradicts" => Some(Self::Contradicts),
            "depends_on" => Some(Self::DependsOn),
            "derived_from" => Some(Self::DerivedFrom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningNode {
    pub id: String,
    pub claim_key: String,
    /// +1 asserts the claim, -1 negates it.
    pub polarity: i64,
    pub label: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningEdge {
    pub id: String,
    pub from_node: String,
    pub to_node: String,
    pub relation: Relation,
    pub updated_at: i64,
}

/// Per-relation edge counts around one node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EdgeCounts {
    pub supports: u32,
    pub contradicts: u32,
    pub depends_on: u32,
    pub derived_from: u32,
}

/// One hop of a bounded traversal.
#[derive(Debug, Clone)]
pub struct TraversalStep {
    pub depth: usize,
    pub relation: Relation,
    pub from_label: String,
    pub to_label: String,
}

/// Claim graph persistence.  The graph may be cyclic; all traversal is
/// visited-set bounded.
#[derive(Clone)]
pub struct ReasoningGraph {
    store: Store,
}

impl ReasoningGraph {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert or refresh the node for `(claim_key, polarity)`; returns its id.
    pub async fn upsert_node(
        &self,
        claim_key: &str,
        polarity: i64,
        label: &str,
    ) -> Result<String> {
        let claim = claim_key.to_string();
        let label = label.to_string();
        self.store
            .with_conn(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM reasoning_nodes WHERE claim_key = ?1 AND polarity = ?2",
                        params![claim, polarity],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        moray_store::rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                match existing {
                    Some(id) => {
                        conn.execute(
                            "UPDATE reasoning_nodes SET label = ?1, updated_at = ?2 WHERE id = ?3",
                            params![label, now_ms(), id],
                        )?;
                        Ok(id)
                    }
                    None => {
                        let id = Uuid::new_v4().to_string();
                        conn.execute(
                            "INSERT INTO reasoning_nodes (id, claim_key, polarity, label, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![id, claim, polarity, label, now_ms()],
                        )?;
                        Ok(id)
                    }
                }
            })
            .await
    }

    pub async fn add_edge(&self, from: &str, to: &str, relation: Relation) -> Result<String> {
        let from = from.to_string();
        let to = to.to_string();
        self.store
            .with_conn(move |conn| {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO reasoning_edges (id, from_node, to_node, relation, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, from, to, relation.as_str(), now_ms()],
                )?;
                Ok(id)
            })
            .await
    }

    pub async fn link_provenance(&self, memory_id: &str, node_id: &str) -> Result<()> {
        let memory = memory_id.to_string();
        let node = node_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO memory_provenance (memory_id, node_id) VALUES (?1, ?2)
                     ON CONFLICT(memory_id) DO UPDATE SET node_id = ?2",
                    params![memory, node],
                )?;
                Ok(())
            })
            .await
    }

    /// The node a memory row's provenance points at, if any.
    pub async fn node_for_memory(&self, memory_id: &str) -> Result<Option<ReasoningNode>> {
        let memory = memory_id.to_string();
        self.store
            .with_conn(move |conn| {
                let node = conn
                    .query_row(
                        "SELECT n.id, n.claim_key, n.polarity, n.label, n.updated_at
                         FROM memory_provenance p
                         JOIN reasoning_nodes n ON n.id = p.node_id
                         WHERE p.memory_id = ?1",
                        params![memory],
                        row_to_node,
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        moray_store::rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(node)
            })
            .await
    }

    /// Count edges touching `node_id`, per relation, in either direction.
    pub async fn edge_counts(&self, node_id: &str) -> Result<EdgeCounts> {
        let node = node_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut counts = EdgeCounts::default();
                let mut stmt = conn.prepare(
                    "SELECT relation, COUNT(*) FROM reasoning_edges
                     WHERE from_node = ?1 OR to_node = ?1 GROUP BY relation",
                )?;
                let rows = stmt
                    .query_map(params![node], |r| {
                        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                for (relation, count) in rows {
                    let count = count as u32;
                    match Relation::parse(&relation) {
                        Some(Relation::Supports) => counts.supports = count,
                        Some(Relation::Contradicts) => counts.contradicts = count,
                        Some(Relation::DependsOn) => counts.depends_on = count,
                        Some(Relation::DerivedFrom) => counts.derived_from = count,
                        None => {}
                    }
                }
                Ok(counts)
            })
            .await
    }

    /// Breadth-first edge expansion from `seeds`, deterministic (edges by
    /// `updated_at DESC`), bounded by `max_depth` and `edge_limit` per node.
    pub async fn traverse(
        &self,
        seeds: &[String],
        max_depth: usize,
        edge_limit: usize,
    ) -> Result<Vec<TraversalStep>> {
        let seeds = seeds.to_vec();
        self.store
            .with_conn(move |conn| {
                let mut steps = Vec::new();
                let mut visited: HashSet<String> = seeds.iter().cloned().collect();
                let mut frontier: VecDeque<(String, usize)> =
                    seeds.into_iter().map(|s| (s, 0)).collect();

                while let Some((node_id, depth)) = frontier.pop_front() {
                    if depth >= max_depth {
                        continue;
                    }
                    let mut stmt = conn.prepare(
                        "SELECT e.relation, e.to_node, f.label, t.label
                         FROM reasoning_edges e
                         JOIN reasoning_nodes f ON f.id = e.from_node
                         JOIN reasoning_nodes t ON t.id = e.to_node
                         WHERE e.from_node = ?1
                         ORDER BY e.updated_at DESC
                         LIMIT ?2",
                    )?;
                    let edges = stmt
                        .query_map(params![node_id, edge_limit as i64], |r| {
                            Ok((
                                r.get::<_, String>(0)?,
                                r.get::<_, String>(1)?,
                                r.get::<_, String>(2)?,
                                r.get::<_, String>(3)?,
                            ))
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    for (relation, to_node, from_label, to_label) in edges {
                        let Some(relation) = Relation::parse(&relation) else {
                            continue;
                        };
                        steps.push(TraversalStep {
                            depth: depth + 1,
                            relation,
                            from_label,
                            to_label,
                        });
                        // Visited set, not acyclicity, keeps this finite.
                        if visited.insert(to_node.clone()) {
                            frontier.push_back((to_node, depth + 1));
                        }
                    }
                }
                Ok(steps)
            })
            .await
    }
}

fn row_to_node(row: &moray_store::rusqlite::Row<'_>) -> moray_store::rusqlite::Result<ReasoningNode> {
    Ok(ReasoningNode {
        id: row.get(0)?,
        claim_key: row.get(1)?,
        polarity: row.get(2)?,
        label: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn graph() -> (tempfile::TempDir, ReasoningGraph) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("graph.db")).await.unwrap();
        (dir, ReasoningGraph::new(store))
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_claim_and_polarity() {
        let (_d, g) = graph().await;
        let a = g.upsert_node("sky is blue", 1, "the sky is blue").await.unwrap();
        let b = g.upsert_node("sky is blue", 1, "sky appears blue").await.unwrap();
        assert_eq!(a, b, "same claim+polarity must reuse the node");
        let neg = g.upsert_node("sky is blue", -1, "the sky is not blue").await.unwrap();
        assert_ne!(a, neg, "opposite polarity is a distinct node");
    }

    #[tokio::test]
    async fn edge_counts_cover_both_directions() {
        let (_d, g) = graph().await;
        let a = g.upsert_node("a", 1, "A").await.unwrap();
        let b = g.upsert_node("b", 1, "B").await.unwrap();
        let c = g.upsert_node("c", 1, "C").await.unwrap();
        g.add_edge(&a, &b, Relation::Supports).await.unwrap();
        g.add_edge(&c, &a, Relation::Contradicts).await.unwrap();
        let counts = g.edge_counts(&a).await.unwrap();
        assert_eq!(counts.supports, 1);
        assert_eq!(counts.contradicts, 1);
        assert_eq!(counts.depends_on, 0);
    }

    #[tokio::test]
    async fn provenance_roundtrip() {
        let (_d, g) = graph().await;
        let node = g.upsert_node("claim", 1, "the claim").await.unwrap();
        g.link_provenance("mem-1", &node).await.unwrap();
        let loaded = g.node_for_memory("mem-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, node);
        assert!(g.node_for_memory("mem-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn traversal_is_depth_bounded() {
        let (_d, g) = graph().await;
        let a = g.upsert_node("a", 1, "A").await.unwrap();
        let b = g.upsert_node("b", 1, "B").await.unwrap();
        let c = g.upsert_node("c", 1, "C").await.unwrap();
        g.add_edge(&a, &b, Relation::Supports).await.unwrap();
        g.add_edge(&b, &c, Relation::DependsOn).await.unwrap();

        let steps = g.traverse(&[a.clone()], 1, 16).await.unwrap();
        assert_eq!(steps.len(), 1, "depth 1 must stop after the first hop");
        let steps = g.traverse(&[a], 2, 16).await.unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn traversal_survives_cycles() {
        let (_d, g) = graph().await;
        let a = g.upsert_node("a", 1, "A").await.unwrap();
        let b = g.upsert_node("b", -1, "not B").await.unwrap();
        g.add_edge(&a, &b, Relation::Contradicts).await.unwrap();
        g.add_edge(&b, &a, Relation::Contradicts).await.unwrap();
        // Without a visited set this would never terminate.
        let steps = g.traverse(&[a], 10, 16).await.unwrap();
        assert!(steps.len() <= 3);
    }

    #[tokio::test]
    async fn traversal_respects_edge_limit() {
        let (_d, g) = graph().await;
        let hub = g.upsert_node("hub", 1, "Hub").await.unwrap();
        for i in 0..5 {
            let spoke = g
                .upsert_node(&format!("spoke{i}"), 1, &format!("Spoke {i}"))
                .await
                .unwrap();
            g.add_edge(&hub, &spoke, Relation::Supports).await.unwrap();
        }
        let steps = g.traverse(&[hub], 1, 2).await.unwrap();
        assert_eq!(steps.len(), 2);
    }
}
