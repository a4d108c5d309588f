// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use moray_config::MemoryConfig;
use moray_store::{now_ms, rusqlite::params, Store};
use tracing::debug;
use uuid::Uuid;

use crate::{
    embed::cosine, EdgeCounts, Embedder, ReasoningGraph, ReasoningNode,
};

/// One retrieved memory chunk with its reasoning annotations.
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub memory_id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub score: f32,
    pub node: Option<ReasoningNode>,
    pub edges: EdgeCounts,
}

/// Raised when retrieved claims collide with opposite polarity.
#[derive(Debug, Clone)]
pub struct ContradictionSignal {
    pub claim_key: String,
    pub asserting_label: String,
    pub negating_label: String,
}

/// The assembled context block handed to the conversation gateway.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub memories: Vec<RetrievedMemory>,
    pub contradictions: Vec<ContradictionSignal>,
    /// Evidence block from bounded graph traversal, ready for the prompt.
    pub evidence: String,
}

impl RetrievalResult {
    /// Render the retrieved memories with stable `[#n]` provenance labels.
    /// Downstream compaction preserves these labels verbatim.
    pub fn context_block(&self) -> String {
        let mut lines = Vec::new();
        for (i, memory) in self.memories.iter().enumerate() {
            lines.push(format!("[#{}] {}", i + 1, memory.content));
        }
        for signal in &self.contradictions {
            lines.push(format!(
                "CONTRADICTION on '{}': \"{}\" vs \"{}\"",
                signal.claim_key, signal.asserting_label, signal.negating_label
            ));
        }
        if !self.evidence.is_empty() {
            lines.push(self.evidence.clone());
        }
        lines.join("\n")
    }
}

/// Chunk + embed + provenance-link on ingest; cosine top-K with reasoning
/// annotations on retrieval.
pub struct MemoryRetriever {
    store: Store,
    graph: ReasoningGraph,
    embedder: Arc<dyn Embedder>,
    cfg: MemoryConfig,
}

impl MemoryRetriever {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, cfg: MemoryConfig) -> Self {
        Self {
            graph: ReasoningGraph::new(store.clone()),
            store,
            embedder,
            cfg,
        }
    }

    pub fn graph(&self) -> &ReasoningGraph {
        &self.graph
    }

    /// Ingest one conversation turn.  Only user and assistant turns carry
    /// memories; system and tool turns are skipped by the caller.
    pub async fn ingest_turn(&self, session_id: &str, text: &str) -> Result<()> {
        for chunk in chunk_text(text) {
            let vector = self.embedder.embed(&chunk).await?;
            let memory_id = Uuid::new_v4().to_string();
            let blob = vector_to_blob(&vector);
            let session = session_id.to_string();
            let content = chunk.clone();
            let id = memory_id.clone();
            self.store
                .with_conn(move |conn| {
                    conn.execute(
                        "INSERT INTO memory_embeddings (id, session_id, content, vector, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![id, session, content, blob, now_ms()],
                    )?;
                    Ok(())
                })
                .await?;

            let (claim_key, polarity) = canonicalize_claim(&chunk);
            if claim_key.is_empty() {
                continue;
            }
            let node_id = self.graph.upsert_node(&claim_key, polarity, &chunk).await?;
            self.graph.link_provenance(&memory_id, &node_id).await?;
        }
        Ok(())
    }

    /// Nearest-neighbor retrieval: current-session rows are preferred, then
    /// global rows fill the remainder of top-K.
    pub async fn retrieve(&self, session_id: &str, query: &str) -> Result<RetrievalResult> {
        let query_vec = self.embedder.embed(query).await?;
        let dim_bytes = self.cfg.memory_embedding_dim * 4;
        let session = session_id.to_string();
        let rows: Vec<(String, Option<String>, String, Vec<u8>)> = self
            .store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, content, vector FROM memory_embeddings
                     ORDER BY CASE WHEN session_id = ?1 THEN 0 ELSE 1 END, created_at DESC
                     LIMIT 512",
                )?;
                let rows = stmt
                    .query_map(params![session], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut scored: Vec<RetrievedMemory> = Vec::new();
        for (memory_id, row_session, content, blob) in rows {
            // Rows written under a different embedding dimension are ignored.
            if blob.len() != dim_bytes && blob.len() != query_vec.len() * 4 {
                continue;
            }
            let vector = blob_to_vector(&blob);
            let score = cosine(&query_vec, &vector);
            if score <= 0.0 {
                continue;
            }
            scored.push(RetrievedMemory {
                memory_id,
                session_id: row_session,
                content,
                score,
                node: None,
                edges: EdgeCounts::default(),
            });
        }
        // Session rows first, then score.
        scored.sort_by(|a, b| {
            let a_local = a.session_id.as_deref() == Some(session_id);
            let b_local = b.session_id.as_deref() == Some(session_id);
            b_local
                .cmp(&a_local)
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        });
        scored.truncate(self.cfg.retrieval_top_k);

        let mut seeds = Vec::new();
        for memory in &mut scored {
            if let Some(node) = self.graph.node_for_memory(&memory.memory_id).await? {
                memory.edges = self.graph.edge_counts(&node.id).await?;
                seeds.push(node.id.clone());
                memory.node = Some(node);
            }
        }

        let contradictions = detect_contradictions(&scored);
        if !contradictions.is_empty() {
            debug!(
                count = contradictions.len(),
                session = %session_id,
                "contradiction signal in retrieved memory"
            );
        }

        let steps = self
            .graph
            .traverse(&seeds, self.cfg.max_depth, self.cfg.edge_limit)
            .await?;
        let evidence = if steps.is_empty() {
            String::new()
        } else {
            let mut lines = vec!["Evidence:".to_string()];
            for step in &steps {
                lines.push(format!(
                    "- \"{}\" {} \"{}\"",
                    step.from_label,
                    step.relation.as_str(),
                    step.to_label
                ));
            }
            lines.join("\n")
        };

        Ok(RetrievalResult {
            memories: scored,
            contradictions,
            evidence,
        })
    }
}

/// Split text into claim-sized chunks: sentences, merged up to ~200 chars.
fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in text.split_inclusive(['.', '!', '?', '\n']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + sentence.len() > 200 {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Normalize a chunk into its claim key and polarity.
///
/// Lowercase, alphanumeric words only; negation tokens flip polarity to -1
/// and are removed from the key so that an assertion and its negation share
/// a claim key.
pub fn canonicalize_claim(chunk: &str) -> (String, i64) {
    let mut polarity = 1i64;
    let mut words = Vec::new();
    for word in chunk
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        match word {
            "not" | "never" | "no" | "isnt" | "dont" | "doesnt" | "wont" | "cant" => {
                polarity = -1;
            }
            _ => words.push(word.to_string()),
        }
    }
    (words.join(" "), polarity)
}

fn detect_contradictions(memories: &[RetrievedMemory]) -> Vec<ContradictionSignal> {
    let mut by_claim: HashMap<&str, (Option<&ReasoningNode>, Option<&ReasoningNode>)> =
        HashMap::new();
    for memory in memories {
        if let Some(node) = &memory.node {
            let entry = by_claim.entry(node.claim_key.as_str()).or_default();
            if node.polarity >= 0 {
                entry.0.get_or_insert(node);
            } else {
                entry.1.get_or_insert(node);
            }
        }
    }
    by_claim
        .into_iter()
        .filter_map(|(claim, (pos, neg))| match (pos, neg) {
            (Some(p), Some(n)) => Some(ContradictionSignal {
                claim_key: claim.to_string(),
                asserting_label: p.label.clone(),
                negating_label: n.label.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
