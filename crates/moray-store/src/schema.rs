// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The full table set, applied idempotently at startup.

pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    platform        TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    degraded_streak INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL REFERENCES sessions(id),
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    tool_calls_json TEXT,
    tool_call_id    TEXT,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE TABLE IF NOT EXISTS orchestration_jobs (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    brief_id    TEXT NOT NULL,
    title       TEXT NOT NULL,
    state       TEXT NOT NULL,
    attempt     INTEGER NOT NULL DEFAULT 0,
    output      TEXT,
    error       TEXT,
    created_at  INTEGER NOT NULL,
    started_at  INTEGER,
    finished_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_jobs_session ON orchestration_jobs(session_id);

CREATE TABLE IF NOT EXISTS orchestration_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL,
    kind       TEXT NOT NULL,
    detail     TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery_queue (
    id              TEXT PRIMARY KEY,
    platform        TEXT NOT NULL,
    chat_id         TEXT NOT NULL,
    payload         TEXT NOT NULL,
    state           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER,
    created_at      INTEGER NOT NULL,
    resolved_at     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_delivery_state ON delivery_queue(state, next_attempt_at);

CREATE TABLE IF NOT EXISTS delivery_attempts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    delivery_id    TEXT NOT NULL REFERENCES delivery_queue(id),
    attempt_number INTEGER NOT NULL,
    started_at     INTEGER NOT NULL,
    completed_at   INTEGER,
    error          TEXT,
    duration_ms    INTEGER,
    UNIQUE (delivery_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS callback_receipts (
    idempotency_key TEXT PRIMARY KEY,
    status_code     INTEGER NOT NULL,
    outcome         TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS model_routing_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_id TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    detail      TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS model_routing_settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runtime_usage_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      TEXT NOT NULL,
    provider_id     TEXT NOT NULL,
    model_id        TEXT NOT NULL,
    profile         TEXT NOT NULL,
    stage           TEXT NOT NULL,
    request_tokens  INTEGER NOT NULL DEFAULT 0,
    response_tokens INTEGER NOT NULL DEFAULT 0,
    latency_ms      INTEGER NOT NULL DEFAULT 0,
    status_code     INTEGER,
    error           TEXT,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_created ON runtime_usage_events(created_at);
CREATE INDEX IF NOT EXISTS idx_usage_session ON runtime_usage_events(session_id);

CREATE TABLE IF NOT EXISTS runtime_budget_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kind       TEXT NOT NULL,
    detail     TEXT,
    session_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runtime_budget_state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
    id                 TEXT PRIMARY KEY,
    incident_type      TEXT NOT NULL,
    severity           TEXT NOT NULL,
    status             TEXT NOT NULL,
    cooldown_until     INTEGER,
    remediation_action TEXT NOT NULL,
    attempts           INTEGER NOT NULL DEFAULT 0,
    evidence_json      TEXT NOT NULL,
    recommended_json   TEXT NOT NULL,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_incidents_type ON incidents(incident_type, status);

CREATE TABLE IF NOT EXISTS incident_timeline (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_id TEXT NOT NULL REFERENCES incidents(id),
    kind        TEXT NOT NULL,
    detail      TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reasoning_nodes (
    id         TEXT PRIMARY KEY,
    claim_key  TEXT NOT NULL,
    polarity   INTEGER NOT NULL,
    label      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_claim ON reasoning_nodes(claim_key);

CREATE TABLE IF NOT EXISTS reasoning_edges (
    id         TEXT PRIMARY KEY,
    from_node  TEXT NOT NULL REFERENCES reasoning_nodes(id),
    to_node    TEXT NOT NULL REFERENCES reasoning_nodes(id),
    relation   TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_edges_from ON reasoning_edges(from_node);

CREATE TABLE IF NOT EXISTS memory_provenance (
    memory_id TEXT PRIMARY KEY,
    node_id   TEXT NOT NULL REFERENCES reasoning_nodes(id)
);

CREATE TABLE IF NOT EXISTS memory_embeddings (
    id         TEXT PRIMARY KEY,
    session_id TEXT,
    content    TEXT NOT NULL,
    vector     BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_session ON memory_embeddings(session_id);
"#;
