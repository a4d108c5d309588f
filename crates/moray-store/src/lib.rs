// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQLite persistence for the moray runtime.
//!
//! The store owns the schema and connection management; each subsystem crate
//! writes its own queries through [`Store::with_conn`].  Connections are
//! opened per call on a blocking thread, with WAL and a busy timeout, so
//! concurrent writers from different tokio tasks serialize at the SQLite
//! layer instead of deadlocking in ours.
//!
//! Every timestamp column is an INTEGER of epoch milliseconds (UTC) so that
//! due-time comparisons (`next_attempt_at <= now`, `cooldown_until > now`)
//! stay plain integer arithmetic in SQL.

mod schema;

use std::path::{Path, PathBuf};

use anyhow::Context;
use rusqlite::Connection;
use tracing::debug;

pub use rusqlite;

/// Handle to the moray database.  Cheap to clone; every clone points at the
/// same file.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

/// Current UTC time as epoch milliseconds — the store's canonical clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store
            .with_conn(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")
                    .context("enabling WAL")?;
                conn.execute_batch(schema::SCHEMA_SQL)
                    .context("applying schema")?;
                Ok(())
            })
            .await?;
        debug!(path = %store.path.display(), "store opened");
        Ok(store)
    }

    /// Run `f` with a fresh connection on a blocking thread.
    ///
    /// Multi-row mutations belong inside a single `conn.transaction()` within
    /// one `with_conn` call; the closure runs to completion before the next
    /// queued call gets a connection.
    pub async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn =
                Connection::open(&path).with_context(|| format!("opening {}", path.display()))?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            f(&mut conn)
        })
        .await
        .context("store task panicked")?
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
