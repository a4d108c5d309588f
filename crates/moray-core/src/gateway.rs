// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use moray_config::ConversationConfig;
use moray_delegate::{
    DelegationBrief, DelegationOrchestrator, DelegationRequest, JobContext, JobExecutor,
};
use moray_model::{ChatMessage, ModelRouter, Role, ToolSchema};
use moray_reason::MemoryRetriever;
use moray_store::Store;
use moray_tools::{LaneCall, LaneExecutor, ToolRegistry};
use tracing::{debug, info, warn};

use crate::{compact::compose_context, complexity::complexity_score, session::SessionStore};

/// Normalized inbound message from a channel adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub platform: String,
    pub sender_id: String,
    pub chat_id: String,
    pub text: Option<String>,
    /// Speech input is handled by an external transcription collaborator;
    /// a message that still carries only audio here is rejected.
    pub audio_file_path: Option<String>,
    pub raw_payload: serde_json::Value,
}

/// Constructor-injected collaborators of the gateway.
pub struct GatewayDeps {
    pub store: Store,
    pub router: Arc<ModelRouter>,
    pub lane: Arc<LaneExecutor>,
    pub registry: Arc<ToolRegistry>,
    pub memory: Arc<MemoryRetriever>,
    pub delegate: Option<Arc<DelegationOrchestrator>>,
}

/// Drives the per-session conversation loop.
pub struct ConversationGateway {
    sessions: SessionStore,
    router: Arc<ModelRouter>,
    lane: Arc<LaneExecutor>,
    registry: Arc<ToolRegistry>,
    memory: Arc<MemoryRetriever>,
    delegate: Option<Arc<DelegationOrchestrator>>,
    cfg: ConversationConfig,
    persona: String,
}

/// How many recent turns stay verbatim in the message list; older turns are
/// summarized into the system prompt tiers.
const HOT_WINDOW_TURNS: usize = 8;

impl ConversationGateway {
    pub fn new(deps: GatewayDeps, cfg: ConversationConfig) -> Self {
        let persona = cfg
            .persona_path
            .as_deref()
            .and_then(|path| match std::fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(path, error = %e, "persona file unreadable; using default persona");
                    None
                }
            })
            .unwrap_or_else(|| {
                "You are moray, a careful personal assistant. Answer plainly and use tools \
                 when they help."
                    .to_string()
            });
        Self {
            sessions: SessionStore::new(deps.store),
            router: deps.router,
            lane: deps.lane,
            registry: deps.registry,
            memory: deps.memory,
            delegate: deps.delegate,
            cfg,
            persona,
        }
    }

    /// Normalize a channel message and run it through the loop.
    pub async fn process_message(&self, message: InboundMessage) -> Result<String> {
        let text = match (&message.text, &message.audio_file_path) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(_)) => {
                bail!("audio input requires the external transcription collaborator")
            }
            _ => bail!("inbound message carries no text"),
        };
        let session_id = self
            .sessions
            .ensure_session(&message.platform, &message.sender_id)
            .await?;
        self.run_conversation(&session_id, &text).await
    }

    /// Entry point for callers that already hold a `{platform}:{senderId}` id.
    pub async fn process_text(&self, session_id: &str, text: &str) -> Result<String> {
        let (platform, sender) = session_id
            .split_once(':')
            .context("session id must be '{platform}:{senderId}'")?;
        let session_id = self.sessions.ensure_session(platform, sender).await?;
        self.run_conversation(&session_id, text).await
    }

    async fn run_conversation(&self, session_id: &str, text: &str) -> Result<String> {
        // Memory lookup happens before the new turn is ingested so the query
        // does not retrieve itself.
        let retrieval = self.memory.retrieve(session_id, text).await?;
        let memory_block = retrieval.context_block();

        self.sessions
            .append_turn(session_id, &ChatMessage::user(text))
            .await?;
        self.memory.ingest_turn(session_id, text).await?;

        let delegation_report = self.maybe_delegate(session_id, text).await?;
        if let Some(report) = &delegation_report {
            let turn = ChatMessage::tool_result("delegation-report", report.clone());
            self.sessions.append_turn(session_id, &turn).await?;
        }

        let turns = self.sessions.load_turns(session_id).await?;
        let split = turns.len().saturating_sub(HOT_WINDOW_TURNS);
        let (older, hot) = turns.split_at(split);
        let composed = compose_context(
            &self.persona,
            &memory_block,
            delegation_report.as_deref(),
            older,
            &self.cfg.context,
        );
        let streak = self
            .sessions
            .record_compaction(session_id, composed.compacted)
            .await?;
        if streak >= 3 {
            info!(session = %session_id, streak, "sustained context compaction");
        }

        let mut messages = Vec::with_capacity(hot.len() + 1);
        messages.push(ChatMessage::system(composed.system_prompt));
        messages.extend(hot.iter().cloned());

        let schemas: Vec<ToolSchema> = self
            .registry
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        for round in 1..=self.cfg.max_tool_rounds {
            let reply = self
                .router
                .create_chat_completion(&messages, &schemas, session_id)
                .await?;

            let assistant_turn = ChatMessage {
                role: Role::Assistant,
                content: reply.content.clone().unwrap_or_default(),
                tool_calls: reply.tool_calls.clone(),
                tool_call_id: None,
            };
            self.sessions.append_turn(session_id, &assistant_turn).await?;
            messages.push(assistant_turn);

            if reply.tool_calls.is_empty() {
                let answer = reply.content.unwrap_or_default();
                self.memory.ingest_turn(session_id, &answer).await?;
                return Ok(answer);
            }

            debug!(
                session = %session_id,
                round,
                calls = reply.tool_calls.len(),
                "dispatching tool lane"
            );
            let lane_calls: Vec<LaneCall> = reply
                .tool_calls
                .iter()
                .map(|tc| LaneCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                })
                .collect();
            let tool_turns = self.lane.run_lane(session_id, &lane_calls).await;
            for turn in tool_turns {
                let message = ChatMessage::tool_result(turn.call_id, turn.content);
                self.sessions.append_turn(session_id, &message).await?;
                messages.push(message);
            }
        }

        Ok(format!(
            "Stopped after {} tool rounds.",
            self.cfg.max_tool_rounds
        ))
    }

    /// Run delegation when the prompt is complex enough; returns the report.
    async fn maybe_delegate(&self, session_id: &str, text: &str) -> Result<Option<String>> {
        let Some(delegate) = &self.delegate else {
            return Ok(None);
        };
        if !self.cfg.delegation_enabled {
            return Ok(None);
        }
        let score = complexity_score(text);
        if score < self.cfg.delegation_min_score {
            return Ok(None);
        }
        info!(session = %session_id, score, "delegating complex prompt");

        let request = DelegationRequest {
            session_id: session_id.to_string(),
            parent_message: text.to_string(),
            scope: "answer one user request; no side effects outside the reply".into(),
            briefs: build_briefs(text),
        };
        let executor = Arc::new(SubAgentExecutor {
            router: Arc::clone(&self.router),
        });
        match delegate.run_delegation(request, executor).await {
            Ok(outcome) => Ok(Some(outcome.summary)),
            Err(e) => {
                // Delegation is an accelerator; its failure degrades to the
                // plain loop instead of failing the conversation.
                warn!(session = %session_id, error = %e, "delegation failed");
                Ok(None)
            }
        }
    }
}

/// Default decomposition: gather facts, then draft from them.
fn build_briefs(text: &str) -> Vec<DelegationBrief> {
    let mut investigate = DelegationBrief::new(
        "investigate",
        "Investigate",
        format!("Collect the facts and constraints needed to answer: {text}"),
    );
    investigate.expected_output = "A short list of findings".into();
    let mut draft = DelegationBrief::new(
        "draft",
        "Draft reply",
        "Draft a concise answer to the user's request using the findings.",
    )
    .depends_on(&["investigate"]);
    draft.scoped_context = text.to_string();
    draft.expected_output = "The reply text".into();
    vec![investigate, draft]
}

/// Delegated jobs are scoped router calls.
struct SubAgentExecutor {
    router: Arc<ModelRouter>,
}

#[async_trait]
impl JobExecutor for SubAgentExecutor {
    async fn run(&self, ctx: JobContext) -> Result<String> {
        if ctx.cancel.is_cancelled() {
            bail!("cancelled before start");
        }
        let system = format!(
            "You are a focused sub-agent working one brief of a larger task.\n\
             Brief: {}\nExpected output: {}",
            ctx.brief.title, ctx.brief.expected_output
        );
        let mut prompt = ctx.brief.objective.clone();
        if !ctx.brief.scoped_context.is_empty() {
            prompt.push_str("\n\nContext:\n");
            prompt.push_str(&ctx.brief.scoped_context);
        }
        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
        let reply = self
            .router
            .create_chat_completion(&messages, &[], &ctx.session_id)
            .await?;
        if ctx.cancel.is_cancelled() {
            bail!("cancelled");
        }
        Ok(reply.content.unwrap_or_default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use moray_budget::BudgetGovernor;
    use moray_config::{
        BudgetConfig, DelegationConfig, MemoryConfig, PolicyConfig, ProviderConfig, ProviderTier,
        RouterConfig,
    };
    use moray_model::{ChatTransport, ScriptedTransport, TransportReply};
    use moray_reason::HashEmbedder;
    use moray_tools::{PolicyEngine, Tool};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes arguments back"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, args: Value) -> Result<Value> {
            Ok(json!(format!("echoed {args}")))
        }
    }

    fn providers() -> Vec<ProviderConfig> {
        vec![ProviderConfig {
            id: "primary".into(),
            model_name: "model-a".into(),
            endpoint: "http://primary/v1/chat/completions".into(),
            api_key_name: "MORAY_GATEWAY_TEST_KEY".into(),
            tier: ProviderTier::Standard,
        }]
    }

    async fn gateway_with(
        replies: Vec<Result<TransportReply>>,
        cfg: ConversationConfig,
        with_delegate: bool,
    ) -> (tempfile::TempDir, Arc<ScriptedTransport>, ConversationGateway) {
        std::env::set_var("MORAY_GATEWAY_TEST_KEY", "k");
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("gw.db")).await.unwrap();
        let budget = Arc::new(BudgetGovernor::new(
            store.clone(),
            BudgetConfig::default(),
            &providers(),
        ));
        let transport = Arc::new(ScriptedTransport::new(replies));
        let router = Arc::new(
            ModelRouter::new(
                store.clone(),
                RouterConfig::default(),
                providers(),
                budget,
                transport.clone() as Arc<dyn ChatTransport>,
            )
            .await
            .unwrap(),
        );
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let registry = Arc::new(registry);
        let policy = Arc::new(PolicyEngine::from_config(&PolicyConfig::default()));
        let lane = Arc::new(LaneExecutor::new(
            Arc::clone(&registry),
            policy,
            Duration::from_millis(cfg.tool_timeout_ms),
        ));
        let memory = Arc::new(MemoryRetriever::new(
            store.clone(),
            Arc::new(HashEmbedder::new(64)),
            MemoryConfig {
                memory_embedding_dim: 64,
                ..MemoryConfig::default()
            },
        ));
        let delegate = with_delegate.then(|| {
            Arc::new(DelegationOrchestrator::new(
                store.clone(),
                DelegationConfig {
                    max_retry_attempts: 0,
                    ..DelegationConfig::default()
                },
            ))
        });
        let deps = GatewayDeps {
            store,
            router,
            lane,
            registry,
            memory,
            delegate,
        };
        (dir, transport, ConversationGateway::new(deps, cfg))
    }

    fn no_delegation_cfg() -> ConversationConfig {
        ConversationConfig {
            delegation_enabled: false,
            ..ConversationConfig::default()
        }
    }

    #[tokio::test]
    async fn plain_reply_roundtrip() {
        let (_d, _t, gw) = gateway_with(
            vec![Ok(TransportReply::text("hello back"))],
            no_delegation_cfg(),
            false,
        )
        .await;
        let reply = gw.process_text("cli:user", "hello").await.unwrap();
        assert_eq!(reply, "hello back");

        let turns = gw.sessions.load_turns("cli:user").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "hello back");
    }

    #[tokio::test]
    async fn tool_round_then_final_answer() {
        let (_d, transport, gw) = gateway_with(
            vec![
                Ok(TransportReply::tool_call("call-1", "echo", r#"{"q":"x"}"#)),
                Ok(TransportReply::text("final answer")),
            ],
            no_delegation_cfg(),
            false,
        )
        .await;
        let reply = gw.process_text("cli:user", "use the tool").await.unwrap();
        assert_eq!(reply, "final answer");
        assert_eq!(transport.calls().len(), 2);

        let turns = gw.sessions.load_turns("cli:user").await.unwrap();
        // user, assistant(tool_call), tool, assistant(final)
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[1].tool_calls.len(), 1);
        assert_eq!(turns[2].role, Role::Tool);
        assert!(turns[2].content.contains("echoed"));
        // Assistant turn precedes the tool turns it spawned.
        assert_eq!(turns[2].tool_call_id.as_deref(), Some("call-1"));
    }

    #[tokio::test]
    async fn loop_stops_after_max_rounds_with_canonical_message() {
        let replies = (0..4)
            .map(|i| Ok(TransportReply::tool_call(format!("c{i}"), "echo", "{}")))
            .collect();
        let cfg = ConversationConfig {
            max_tool_rounds: 2,
            delegation_enabled: false,
            ..ConversationConfig::default()
        };
        let (_d, transport, gw) = gateway_with(replies, cfg, false).await;
        let reply = gw.process_text("cli:user", "loop forever").await.unwrap();
        assert_eq!(reply, "Stopped after 2 tool rounds.");
        assert_eq!(transport.calls().len(), 2, "no further model call after the cap");

        let turns = gw.sessions.load_turns("cli:user").await.unwrap();
        let assistant_turns = turns.iter().filter(|t| t.role == Role::Assistant).count();
        assert_eq!(assistant_turns, 2, "no synthetic assistant turn after the cap");
    }

    #[tokio::test]
    async fn unknown_tool_call_recovers_in_conversation() {
        let (_d, _t, gw) = gateway_with(
            vec![
                Ok(TransportReply::tool_call("c1", "missing_tool", "{}")),
                Ok(TransportReply::text("recovered")),
            ],
            no_delegation_cfg(),
            false,
        )
        .await;
        let reply = gw.process_text("cli:user", "hi").await.unwrap();
        assert_eq!(reply, "recovered");
        let turns = gw.sessions.load_turns("cli:user").await.unwrap();
        assert!(turns[2]
            .content
            .contains("Error: Tool 'missing_tool' is not registered or unavailable."));
    }

    #[tokio::test]
    async fn complex_prompt_triggers_delegation_and_synthetic_tool_turn() {
        // Replies: investigate job, draft job, then the main loop's answer.
        let (_d, transport, gw) = gateway_with(
            vec![
                Ok(TransportReply::text("finding: queue grows at night")),
                Ok(TransportReply::text("draft: throttle the importer")),
                Ok(TransportReply::text("final: throttle the importer at night")),
            ],
            ConversationConfig::default(),
            true,
        )
        .await;
        let prompt = "research the queue growth and then summarize what to change";
        let reply = gw.process_text("cli:user", prompt).await.unwrap();
        assert_eq!(reply, "final: throttle the importer at night");
        assert_eq!(transport.calls().len(), 3);

        let turns = gw.sessions.load_turns("cli:user").await.unwrap();
        let delegation_turn = turns
            .iter()
            .find(|t| t.tool_call_id.as_deref() == Some("delegation-report"))
            .expect("delegation report must be a persisted tool turn");
        assert!(delegation_turn.content.contains("2/2 briefs completed"));
    }

    #[tokio::test]
    async fn simple_prompt_skips_delegation() {
        let (_d, transport, gw) = gateway_with(
            vec![Ok(TransportReply::text("hi"))],
            ConversationConfig::default(),
            true,
        )
        .await;
        gw.process_text("cli:user", "hello there").await.unwrap();
        assert_eq!(transport.calls().len(), 1, "no sub-agent calls for a trivial prompt");
    }

    #[tokio::test]
    async fn process_message_derives_session_key() {
        let (_d, _t, gw) = gateway_with(
            vec![Ok(TransportReply::text("ok"))],
            no_delegation_cfg(),
            false,
        )
        .await;
        let message = InboundMessage {
            platform: "telegram".into(),
            sender_id: "42".into(),
            chat_id: "chat-9".into(),
            text: Some("ping".into()),
            audio_file_path: None,
            raw_payload: json!({}),
        };
        gw.process_message(message).await.unwrap();
        let turns = gw.sessions.load_turns("telegram:42").await.unwrap();
        assert_eq!(turns.len(), 2);
    }

    #[tokio::test]
    async fn audio_only_message_is_rejected() {
        let (_d, _t, gw) = gateway_with(vec![], no_delegation_cfg(), false).await;
        let message = InboundMessage {
            platform: "telegram".into(),
            sender_id: "42".into(),
            chat_id: "c".into(),
            text: None,
            audio_file_path: Some("/tmp/voice.ogg".into()),
            raw_payload: json!({}),
        };
        let err = gw.process_message(message).await.unwrap_err();
        assert!(err.to_string().contains("transcription"));
    }

    #[tokio::test]
    async fn second_turn_sees_memory_from_first() {
        let (_d, transport, gw) = gateway_with(
            vec![
                Ok(TransportReply::text("noted")),
                Ok(TransportReply::text("port 5432")),
            ],
            no_delegation_cfg(),
            false,
        )
        .await;
        gw.process_text("cli:user", "The database listens on port 5432.")
            .await
            .unwrap();
        gw.process_text("cli:user", "which port does the database listen on?")
            .await
            .unwrap();
        let second_request = &transport.calls()[1].body;
        let system = second_request["messages"][0]["content"].as_str().unwrap();
        assert!(
            system.contains("[#1]"),
            "memory block with provenance label expected in system prompt: {system}"
        );
    }
}
