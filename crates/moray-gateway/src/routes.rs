// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use moray_budget::BudgetProfile;
use moray_model::FallbackMode;
use moray_store::{now_ms, rusqlite::params};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::{AppState, WebhookSink};

/// One accepted webhook callback, handed to the sink exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub task_id: String,
    pub event_type: String,
    pub status: String,
    pub payload: Value,
}

fn ok_body(data: Value) -> Json<Value> {
    Json(json!({ "ok": true, "data": data }))
}

fn err_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": message }))).into_response()
}

// ── Webhook ingest ────────────────────────────────────────────────────────────

/// Idempotent webhook ingest keyed by `{taskId}:{eventType}:{status}`.
///
/// 202 on first acceptance, 200 with `outcome=duplicate` on replays, 400
/// with `outcome=rejected` for well-formed bodies with empty fields.
pub(crate) async fn callback_webhook(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
    let (Some(task_id), Some(event_type), Some(status)) =
        (field("taskId"), field("eventType"), field("status"))
    else {
        return err_body(
            StatusCode::BAD_REQUEST,
            "taskId, eventType and status are required",
        );
    };

    let key = format!("{task_id}:{event_type}:{status}");
    if task_id.is_empty() || event_type.is_empty() || status.is_empty() {
        if let Err(e) = insert_receipt(&state, &key, 400, "rejected").await {
            warn!(error = %e, "failed to persist rejected receipt");
        }
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": "empty callback fields", "data": { "outcome": "rejected" } })),
        )
            .into_response();
    }

    let inserted = match insert_receipt(&state, &key, 202, "accepted").await {
        Ok(inserted) => inserted,
        Err(e) => {
            warn!(error = %e, "receipt write failed");
            return err_body(StatusCode::SERVICE_UNAVAILABLE, "receipt store unavailable");
        }
    };
    if !inserted {
        return (
            StatusCode::OK,
            Json(json!({ "ok": true, "data": { "outcome": "duplicate" } })),
        )
            .into_response();
    }

    let event = WebhookEvent {
        task_id,
        event_type,
        status,
        payload: body,
    };
    if let Err(e) = state.webhook_sink.handle(event).await {
        // The receipt stands: at-most-once means the sink is never retried
        // through this path.
        warn!(error = %e, "webhook sink failed");
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({ "ok": true, "data": { "outcome": "accepted" } })),
    )
        .into_response()
}

/// Insert the receipt if its key is new; `Ok(false)` means duplicate.
async fn insert_receipt(
    state: &AppState,
    key: &str,
    status_code: u16,
    outcome: &str,
) -> anyhow::Result<bool> {
    let key = key.to_string();
    let outcome = outcome.to_string();
    state
        .store
        .with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO callback_receipts
                 (idempotency_key, status_code, outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, status_code as i64, outcome, now_ms()],
            )?;
            Ok(changed == 1)
        })
        .await
}

// ── Health surfaces ───────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<AppState>) -> Response {
    let store_ok = state
        .store
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .is_ok();
    if !store_ok {
        return err_body(StatusCode::SERVICE_UNAVAILABLE, "store unreachable");
    }

    let routing = state.router.health_snapshot();
    let open_incidents = state.incidents.current().await.unwrap_or_default();
    let status = if !open_incidents.is_empty() || routing.consecutive_failures > 0 {
        "degraded"
    } else {
        "ok"
    };
    ok_body(json!({
        "status": status,
        "uptime_ms": now_ms() - state.started_at,
        "open_incidents": open_incidents.len(),
        "routing": routing,
    }))
    .into_response()
}

pub(crate) async fn readiness(State(state): State<AppState>) -> Response {
    let store_ok = state
        .store
        .with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .is_ok();
    let routing = state.router.health_snapshot();
    let providers_ok = !routing.providers.is_empty();
    let queue_ok = state.queue.stats().await.is_ok();

    let checks = json!([
        { "name": "store", "ok": store_ok, "detail": "schema reachable" },
        { "name": "providers", "ok": providers_ok,
          "detail": format!("{} configured", routing.providers.len()) },
        { "name": "delivery_queue", "ok": queue_ok, "detail": "stats readable" },
    ]);
    let all_ok = store_ok && providers_ok && queue_ok;
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ok": all_ok, "data": { "checks": checks } }))).into_response()
}

pub(crate) async fn reliability(State(state): State<AppState>) -> Response {
    let queue_stats = match state.queue.stats().await {
        Ok(stats) => stats,
        Err(_) => return err_body(StatusCode::SERVICE_UNAVAILABLE, "queue stats unavailable"),
    };
    let callback_counts = state
        .store
        .with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT outcome, COUNT(*) FROM callback_receipts GROUP BY outcome")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().collect::<HashMap<String, i64>>())
        })
        .await
        .unwrap_or_default();
    ok_body(json!({
        "queue": queue_stats,
        "callbacks": {
            "accepted": callback_counts.get("accepted").copied().unwrap_or(0),
            "duplicate": callback_counts.get("duplicate").copied().unwrap_or(0),
            "rejected": callback_counts.get("rejected").copied().unwrap_or(0),
        },
    }))
    .into_response()
}

// ── Budget ────────────────────────────────────────────────────────────────────

pub(crate) async fn budget_state(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let session = query
        .get("session_id")
        .map(String::as_str)
        .unwrap_or("control-plane");
    match state.budget.snapshot(session).await {
        Ok(snapshot) => ok_body(json!(snapshot)).into_response(),
        Err(e) => {
            warn!(error = %e, "budget snapshot failed");
            err_body(StatusCode::SERVICE_UNAVAILABLE, "budget state unavailable")
        }
    }
}

pub(crate) async fn budget_events(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let limit = query
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(50);
    match state.budget.events(limit).await {
        Ok(events) => ok_body(json!(events)).into_response(),
        Err(_) => err_body(StatusCode::SERVICE_UNAVAILABLE, "budget events unavailable"),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProfileBody {
    /// Profile name, or null to clear the manual override.
    profile: Option<String>,
    session_id: Option<String>,
}

pub(crate) async fn budget_profile(
    State(state): State<AppState>,
    Json(body): Json<ProfileBody>,
) -> Response {
    let session = body.session_id.as_deref().unwrap_or("control-plane");
    let profile = match &body.profile {
        None => None,
        Some(name) => match BudgetProfile::parse(name) {
            Some(profile) => Some(profile),
            None => {
                return err_body(
                    StatusCode::BAD_REQUEST,
                    "profile must be economy, balanced or performance",
                )
            }
        },
    };
    match state.budget.set_manual_profile(profile, session).await {
        Ok(()) => ok_body(json!({
            "manual_profile": profile.map(|p| p.as_str()),
        }))
        .into_response(),
        Err(_) => err_body(StatusCode::SERVICE_UNAVAILABLE, "budget state unavailable"),
    }
}

// ── Routing ───────────────────────────────────────────────────────────────────

pub(crate) async fn routing_telemetry(State(state): State<AppState>) -> Response {
    let health = state.router.health_snapshot();
    let events = state.router.recent_events();
    ok_body(json!({ "health": health, "events": events })).into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModeBody {
    mode: String,
}

pub(crate) async fn routing_mode(
    State(state): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Response {
    let Some(mode) = FallbackMode::parse(&body.mode) else {
        return err_body(
            StatusCode::BAD_REQUEST,
            "mode must be intelligent_pacing or aggressive_fallback",
        );
    };
    match state.router.set_fallback_mode(mode).await {
        Ok(()) => ok_body(json!({ "mode": mode.as_str() })).into_response(),
        Err(_) => err_body(StatusCode::SERVICE_UNAVAILABLE, "mode persistence failed"),
    }
}

// ── Incidents ─────────────────────────────────────────────────────────────────

pub(crate) async fn incidents_current(State(state): State<AppState>) -> Response {
    match state.incidents.current().await {
        Ok(incidents) => ok_body(json!(incidents)).into_response(),
        Err(_) => err_body(StatusCode::SERVICE_UNAVAILABLE, "incident store unavailable"),
    }
}

pub(crate) async fn incidents_history(State(state): State<AppState>) -> Response {
    match state.incidents.history().await {
        Ok(incidents) => ok_body(json!(incidents)).into_response(),
        Err(_) => err_body(StatusCode::SERVICE_UNAVAILABLE, "incident store unavailable"),
    }
}

pub(crate) async fn incidents_evaluate(State(state): State<AppState>) -> Response {
    match state.incidents.evaluate().await {
        Ok(open) => ok_body(json!(open)).into_response(),
        Err(e) => {
            warn!(error = %e, "forced incident evaluation failed");
            err_body(StatusCode::SERVICE_UNAVAILABLE, "evaluation failed")
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
