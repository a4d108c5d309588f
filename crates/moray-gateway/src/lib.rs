// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP control plane.
//!
//! Every route sits behind the HMAC signature middleware and answers with
//! the `{ok, data|error}` envelope.  Error bodies never carry secret
//! values; upstream error strings are sanitized before they get here.

pub mod auth;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{middleware, routing::get, routing::post, Router};
use moray_budget::BudgetGovernor;
use moray_delivery::DeliveryQueue;
use moray_incident::IncidentManager;
use moray_model::ModelRouter;
use moray_store::Store;
use tracing::info;

pub use auth::{canonical_json, sign, AuthState};
pub use routes::WebhookEvent;

/// Receives each accepted webhook callback exactly once per idempotency key.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn handle(&self, event: WebhookEvent) -> Result<()>;
}

/// Everything the handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub(crate) auth: AuthState,
    pub(crate) store: Store,
    pub(crate) budget: Arc<BudgetGovernor>,
    pub(crate) router: Arc<ModelRouter>,
    pub(crate) queue: Arc<DeliveryQueue>,
    pub(crate) incidents: Arc<IncidentManager>,
    pub(crate) webhook_sink: Arc<dyn WebhookSink>,
    pub(crate) started_at: i64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        secret: Vec<u8>,
        auth_failures_per_minute: u32,
        store: Store,
        budget: Arc<BudgetGovernor>,
        router: Arc<ModelRouter>,
        queue: Arc<DeliveryQueue>,
        incidents: Arc<IncidentManager>,
        webhook_sink: Arc<dyn WebhookSink>,
    ) -> Self {
        Self {
            auth: AuthState::new(secret, auth_failures_per_minute),
            store,
            budget,
            router,
            queue,
            incidents,
            webhook_sink,
            started_at: moray_store::now_ms(),
        }
    }
}

/// Build the route tree.  Exposed separately from [`serve`] so tests can
/// drive it with `tower::ServiceExt::oneshot`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/callback/webhook", post(routes::callback_webhook))
        .route("/health", get(routes::health))
        .route("/readiness", get(routes::readiness))
        .route("/doctor", get(routes::readiness))
        .route("/reliability", get(routes::reliability))
        .route("/budget/state", get(routes::budget_state))
        .route("/budget/events", get(routes::budget_events))
        .route("/budget/profile", post(routes::budget_profile))
        .route("/routing/telemetry", get(routes::routing_telemetry))
        .route("/routing/mode", post(routes::routing_mode))
        .route("/incidents/current", get(routes::incidents_current))
        .route("/incidents/history", get(routes::incidents_history))
        .route("/incidents/evaluate", post(routes::incidents_evaluate))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::signature_mw,
        ))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control plane on {addr}"))?;
    info!(%addr, "control plane listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("control plane server failed")
}
