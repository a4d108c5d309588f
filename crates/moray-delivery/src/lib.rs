// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistent outbound delivery queue.
//!
//! Replies are enqueued durably and drained by a background worker.  The
//! dequeue transaction marks claimed rows `dispatching` and increments their
//! attempt counter atomically, giving at-most-once dispatch per polling
//! cycle.  Every dispatch writes a row in the dense attempts ledger; failed
//! deliveries back off exponentially and dead-letter after `max_attempts`.

mod queue;
mod worker;

pub use queue::{
    DeliveryQueue, DeliveryRecord, DeliveryState, QueueControls, QueueMode, QueueStats,
};
pub use worker::{spawn_worker, OutboundAdapter};
