// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::DeliveryQueue;

/// Channel transport seam: sends one payload to one chat.
///
/// Production adapters wrap the external channel collaborators (Telegram,
/// WhatsApp); tests use scripted implementations.
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    async fn deliver(&self, platform: &str, chat_id: &str, payload: &str) -> anyhow::Result<()>;
}

/// Run the drain loop until `cancel` fires.  In-flight dispatches complete
/// before the task exits.
pub fn spawn_worker(
    queue: Arc<DeliveryQueue>,
    adapter: Arc<dyn OutboundAdapter>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(queue.poll_interval_ms().max(10));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = queue.process_due(adapter.as_ref()).await {
                warn!(error = %e, "delivery worker cycle failed");
            }
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
