// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The HTTP seam of the router.
//!
//! Production uses [`HttpChatTransport`] (reqwest).  Tests use
//! [`ScriptedTransport`], which pops pre-built replies per call and records
//! every request, so router behavior — failover order, pacing retries,
//! cooldown bookkeeping — is exercised without network access.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

/// A raw provider response, reduced to what routing decisions need.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    /// Verbatim `Retry-After` header, if present.
    pub retry_after: Option<String>,
    pub body: Value,
}

impl TransportReply {
    /// 200 reply with a plain assistant text message.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": content.into() } }],
                "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
            }),
        }
    }

    /// 429 reply with a `Retry-After` header value.
    pub fn rate_limited(retry_after: impl Into<String>) -> Self {
        Self {
            status: 429,
            retry_after: Some(retry_after.into()),
            body: serde_json::json!({ "error": { "message": "rate limited" } }),
        }
    }

    /// Arbitrary non-2xx failure.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: serde_json::json!({ "error": { "message": "upstream error" } }),
        }
    }

    /// 200 reply whose assistant message requests a tool call.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: serde_json::json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": id.into(),
                        "type": "function",
                        "function": { "name": name.into(), "arguments": args.into() }
                    }]
                }}],
                "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
            }),
        }
    }
}

/// One recorded outbound request (scripted transport only).
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: String,
    pub body: Value,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// POST `body` to `endpoint` with a bearer `api_key`; classify the reply.
    ///
    /// An `Err` means the request never produced an HTTP status (DNS, TLS,
    /// timeout); HTTP-level failures come back as `Ok` with their status.
    async fn post_chat(
        &self,
        endpoint: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> anyhow::Result<TransportReply>;
}

/// reqwest-backed production transport.
pub struct HttpChatTransport {
    client: reqwest::Client,
}

impl HttpChatTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpChatTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn post_chat(
        &self,
        endpoint: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> anyhow::Result<TransportReply> {
        let resp = self
            .client
            .post(endpoint)
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(TransportReply {
            status,
            retry_after,
            body,
        })
    }
}

/// Pre-scripted transport for tests.  Each call pops the next reply from the
/// front of the queue; requests are recorded for inspection.
pub struct ScriptedTransport {
    replies: Mutex<Vec<anyhow::Result<TransportReply>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<anyhow::Result<TransportReply>>) -> Self {
        Self {
            replies: Mutex::new(replies),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every request seen so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Endpoints hit so far — the quickest way to assert routing order.
    pub fn endpoints(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.endpoint.clone())
            .collect()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn post_chat(
        &self,
        endpoint: &str,
        _api_key: &str,
        body: &Value,
        _timeout: Duration,
    ) -> anyhow::Result<TransportReply> {
        self.calls.lock().unwrap().push(RecordedCall {
            endpoint: endpoint.to_string(),
            body: body.clone(),
        });
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Ok(TransportReply::text("[no more scripts]"));
        }
        replies.remove(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
