// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Result;
use moray_model::{ChatMessage, Role, ToolCallPayload};
use moray_store::{now_ms, rusqlite::params, Store};
use uuid::Uuid;

/// Session and turn persistence.
///
/// A session's identity key is `{platform}:{senderId}`; it is created lazily
/// on first message and owns its ordered conversation turns.
#[derive(Clone)]
pub struct SessionStore {
    store: Store,
}

impl SessionStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create the session row if it does not exist yet; returns the id.
    pub async fn ensure_session(&self, platform: &str, sender_id: &str) -> Result<String> {
        let id = format!("{platform}:{sender_id}");
        let session_id = id.clone();
        let platform = platform.to_string();
        let sender = sender_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO sessions
                     (id, platform, sender_id, degraded_streak, created_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    params![session_id, platform, sender, now_ms()],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// Append one turn; insertion order is the conversation order.
    pub async fn append_turn(&self, session_id: &str, message: &ChatMessage) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let row_id = id.clone();
        let session = session_id.to_string();
        let role = message.role.as_str().to_string();
        let content = message.content.clone();
        let tool_calls_json = if message.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.tool_calls)?)
        };
        let tool_call_id = message.tool_call_id.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO messages
                     (id, session_id, role, content, tool_calls_json, tool_call_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![row_id, session, role, content, tool_calls_json, tool_call_id, now_ms()],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// All turns of a session in insertion order.
    pub async fn load_turns(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let session = session_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT role, content, tool_calls_json, tool_call_id
                     FROM messages WHERE session_id = ?1 ORDER BY rowid ASC",
                )?;
                let rows = stmt
                    .query_map(params![session], |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, Option<String>>(2)?,
                            r.get::<_, Option<String>>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut turns = Vec::with_capacity(rows.len());
                for (role, content, tool_calls_json, tool_call_id) in rows {
                    let Some(role) = Role::parse(&role) else {
                        continue;
                    };
                    let tool_calls: Vec<ToolCallPayload> = tool_calls_json
                        .as_deref()
                        .and_then(|j| serde_json::from_str(j).ok())
                        .unwrap_or_default();
                    turns.push(ChatMessage {
                        role,
                        content,
                        tool_calls,
                        tool_call_id,
                    });
                }
                Ok(turns)
            })
            .await
    }

    /// Track sustained compaction: a compacted turn bumps the streak, a
    /// clean turn resets it.  Returns the new streak.
    pub async fn record_compaction(&self, session_id: &str, compacted: bool) -> Result<u32> {
        let session = session_id.to_string();
        self.store
            .with_conn(move |conn| {
                if compacted {
                    conn.execute(
                        "UPDATE sessions SET degraded_streak = degraded_streak + 1 WHERE id = ?1",
                        params![session],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE sessions SET degraded_streak = 0 WHERE id = ?1",
                        params![session],
                    )?;
                }
                let streak: i64 = conn.query_row(
                    "SELECT degraded_streak FROM sessions WHERE id = ?1",
                    params![session],
                    |r| r.get(0),
                )?;
                Ok(streak as u32)
            })
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn sessions() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("s.db")).await.unwrap();
        (dir, SessionStore::new(store))
    }

    #[tokio::test]
    async fn ensure_session_is_lazy_and_idempotent() {
        let (_d, s) = sessions().await;
        let a = s.ensure_session("telegram", "42").await.unwrap();
        let b = s.ensure_session("telegram", "42").await.unwrap();
        assert_eq!(a, "telegram:42");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn turns_roundtrip_in_order() {
        let (_d, s) = sessions().await;
        let id = s.ensure_session("cli", "u").await.unwrap();
        s.append_turn(&id, &ChatMessage::user("first")).await.unwrap();
        s.append_turn(&id, &ChatMessage::assistant("second")).await.unwrap();
        s.append_turn(&id, &ChatMessage::tool_result("call-1", "third"))
            .await
            .unwrap();
        let turns = s.load_turns(&id).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "first");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[2].tool_call_id.as_deref(), Some("call-1"));
    }

    #[tokio::test]
    async fn tool_calls_survive_persistence() {
        let (_d, s) = sessions().await;
        let id = s.ensure_session("cli", "u").await.unwrap();
        let mut turn = ChatMessage::assistant("");
        turn.tool_calls = vec![ToolCallPayload {
            id: "call-1".into(),
            call_type: "function".into(),
            function: moray_model::FunctionCall {
                name: "lookup".into(),
                arguments: r#"{"q":"x"}"#.into(),
            },
        }];
        s.append_turn(&id, &turn).await.unwrap();
        let turns = s.load_turns(&id).await.unwrap();
        assert_eq!(turns[0].tool_calls.len(), 1);
        assert_eq!(turns[0].tool_calls[0].function.name, "lookup");
    }

    #[tokio::test]
    async fn compaction_streak_accumulates_and_resets() {
        let (_d, s) = sessions().await;
        let id = s.ensure_session("cli", "u").await.unwrap();
        assert_eq!(s.record_compaction(&id, true).await.unwrap(), 1);
        assert_eq!(s.record_compaction(&id, true).await.unwrap(), 2);
        assert_eq!(s.record_compaction(&id, false).await.unwrap(), 0);
    }
}
