// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation gateway.
//!
//! Drives one inbound message through the whole orchestration plane: session
//! bookkeeping, reasoning-aware context assembly, the optional delegation
//! run, and the bounded model ↔ tools loop.  The loop is serial per session;
//! everything it calls (router, lane, delegation) runs on the shared tokio
//! runtime.

mod compact;
mod complexity;
mod gateway;
mod session;

pub use compact::{compact_segment, compose_context, ComposedContext};
pub use complexity::{complexity_score, DELEGATION_KEYWORDS};
pub use gateway::{ConversationGateway, GatewayDeps, InboundMessage};
pub use session::SessionStore;
