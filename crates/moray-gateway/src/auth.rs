// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HMAC request signing and per-IP rate limiting.
//!
//! # Signing
//!
//! Every control-plane request carries
//! ```text
//! x-signature: sha256=<hex>
//! ```
//! computed as HMAC-SHA256 over the *canonical* JSON body (object keys
//! sorted recursively, compact separators); requests without a body sign
//! the empty string.  Comparison uses [`subtle::ConstantTimeEq`] to prevent
//! timing oracles.  The secret is resolved from the environment at startup
//! and never logged.
//!
//! # Rate limiting
//!
//! Failed signature checks are rate limited per IP with the `governor`
//! crate (GCRA).  Loopback addresses are exempt: a local process with
//! loopback access already has local access to the machine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;
type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Signature verification state threaded through the middleware.
#[derive(Clone)]
pub struct AuthState {
    secret: Arc<Vec<u8>>,
    limiter: Arc<IpLimiter>,
}

impl AuthState {
    /// `failures_per_minute` caps failed signature checks per source IP.
    pub fn new(secret: Vec<u8>, failures_per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(failures_per_minute.max(1)).expect("max(1) is nonzero"),
        );
        Self {
            secret: Arc::new(secret),
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }
}

/// Serialize `value` with object keys sorted recursively and compact
/// separators — the shape both sides of the HMAC agree on.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// `sha256=<hex>` signature of `payload` under `secret`.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Axum middleware verifying `x-signature` before any handler runs.
///
/// Rejected requests mutate no state: 401 for a bad signature, 400 for an
/// unparsable body, 429 once an IP exceeds its failed-attempt quota.
pub async fn signature_mw(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    let (parts, body) = request.into_parts();

    let bytes = match to_bytes(body, 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "body too large"),
    };
    let canonical = if bytes.is_empty() {
        String::new()
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => canonical_json(&value),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "body is not valid JSON"),
        }
    };

    let provided = parts
        .headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected = sign(&state.auth.secret, canonical.as_bytes());
    let valid: bool = expected.as_bytes().ct_eq(provided.as_bytes()).into();

    if !valid {
        if !ip.is_loopback() && state.auth.limiter.check_key(&ip).is_err() {
            warn!(%ip, "signature failures rate limited");
            return error_response(StatusCode::TOO_MANY_REQUESTS, "too many failed attempts");
        }
        warn!(%ip, path = %parts.uri.path(), "rejected unsigned control-plane request");
        return error_response(StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "ok": false, "error": message })),
    )
        .into_response()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
