// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Multi-provider model routing.
//!
//! The router walks an ordered provider list (the *preferred order*), shaped
//! per request by the budget governor's directive, and returns the first
//! usable assistant message.  Rate limits put providers on cooldown; the two
//! fallback modes differ in whether a cooldown is waited out
//! (`intelligent_pacing`) or skipped immediately (`aggressive_fallback`).
//!
//! All HTTP goes through the [`ChatTransport`] seam so tests drive the full
//! selection/cooldown/failover logic with scripted responses.

mod retry;
mod router;
mod telemetry;
mod transport;
mod types;

pub use retry::parse_retry_after;
pub use router::{FallbackMode, ModelRouter, ProviderUsage, RouterError, RouterHealth};
pub use telemetry::{RoutingEvent, RoutingEventKind};
pub use transport::{
    ChatTransport, HttpChatTransport, RecordedCall, ScriptedTransport, TransportReply,
};
pub use types::*;
