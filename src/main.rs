// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use moray_budget::BudgetGovernor;
use moray_config::Config;
use moray_core::{ConversationGateway, GatewayDeps};
use moray_delegate::DelegationOrchestrator;
use moray_delivery::{spawn_worker, DeliveryQueue, OutboundAdapter};
use moray_gateway::{AppState, WebhookEvent, WebhookSink};
use moray_incident::IncidentManager;
use moray_model::{ChatTransport, HttpChatTransport, ModelRouter};
use moray_reason::{HashEmbedder, MemoryRetriever};
use moray_store::Store;
use moray_tools::{builtin, LaneExecutor, PolicyEngine, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(moray_config::load(cli.config.as_deref())?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(config).await,
        Commands::Send {
            platform,
            sender,
            text,
        } => run_send(config, &platform, &sender, &text.join(" ")).await,
        Commands::Doctor => run_doctor(config).await,
        Commands::Config => {
            println!("{}", config.to_display_yaml());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("moray={default_level},warn")));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// All long-lived subsystems, assembled once per process.
struct Runtime {
    store: Store,
    budget: Arc<BudgetGovernor>,
    router: Arc<ModelRouter>,
    queue: Arc<DeliveryQueue>,
    incidents: Arc<IncidentManager>,
    delegate: Arc<DelegationOrchestrator>,
    conversation: Arc<ConversationGateway>,
}

async fn build_runtime(config: &Config) -> anyhow::Result<Runtime> {
    let store_path = config.store_path.clone().unwrap_or_else(|| {
        tracing::warn!("store_path not configured; using ./moray.db");
        "moray.db".into()
    });
    let store = Store::open(&store_path)
        .await
        .context("opening the persistent store")?;

    let budget = Arc::new(BudgetGovernor::new(
        store.clone(),
        config.budget.clone(),
        &config.providers,
    ));
    let transport: Arc<dyn ChatTransport> = Arc::new(HttpChatTransport::new());
    let router = Arc::new(
        ModelRouter::new(
            store.clone(),
            config.router.clone(),
            config.providers.clone(),
            Arc::clone(&budget),
            transport,
        )
        .await?,
    );

    let mut registry = ToolRegistry::new();
    registry.register(builtin::CurrentTimeTool);
    registry.register(builtin::CalculatorTool);
    registry.register_alias("time", "current_time");
    registry.register_alias("calc", "calculator");
    let registry = Arc::new(registry);
    let policy = Arc::new(PolicyEngine::from_config(&config.policy));
    let lane = Arc::new(LaneExecutor::new(
        Arc::clone(&registry),
        policy,
        std::time::Duration::from_millis(config.conversation.tool_timeout_ms),
    ));

    let memory = Arc::new(MemoryRetriever::new(
        store.clone(),
        Arc::new(HashEmbedder::new(config.memory.memory_embedding_dim)),
        config.memory.clone(),
    ));
    let delegate = Arc::new(DelegationOrchestrator::new(
        store.clone(),
        config.delegation.clone(),
    ));
    let queue = Arc::new(DeliveryQueue::new(store.clone(), config.queue.clone()));
    let incidents = Arc::new(IncidentManager::new(
        store.clone(),
        config.incident.clone(),
        Arc::clone(&queue),
        Arc::clone(&router),
    ));

    let conversation = Arc::new(ConversationGateway::new(
        GatewayDeps {
            store: store.clone(),
            router: Arc::clone(&router),
            lane,
            registry,
            memory,
            delegate: Some(Arc::clone(&delegate)),
        },
        config.conversation.clone(),
    ));

    Ok(Runtime {
        store,
        budget,
        router,
        queue,
        incidents,
        delegate,
        conversation,
    })
}

/// Outbound adapter used until a channel crate is wired in: replies land in
/// the log instead of a chat network.
struct LogAdapter;

#[async_trait::async_trait]
impl OutboundAdapter for LogAdapter {
    async fn deliver(&self, platform: &str, chat_id: &str, payload: &str) -> anyhow::Result<()> {
        tracing::info!(platform, chat_id, %payload, "outbound delivery");
        Ok(())
    }
}

/// Accepted webhook callbacks become queued notifications for the operator.
struct NotifySink {
    queue: Arc<DeliveryQueue>,
}

#[async_trait::async_trait]
impl WebhookSink for NotifySink {
    async fn handle(&self, event: WebhookEvent) -> anyhow::Result<()> {
        self.queue
            .enqueue(
                "control",
                "operator",
                &format!(
                    "task {} {}: {}",
                    event.task_id, event.event_type, event.status
                ),
            )
            .await?;
        Ok(())
    }
}

async fn run_serve(config: Arc<Config>) -> anyhow::Result<()> {
    // Fatal startup check: the control plane cannot run unsigned.  The
    // message names the variable, never its value.
    let secret = std::env::var(&config.api.api_secret_name).unwrap_or_default();
    if secret.is_empty() {
        bail!(
            "control-plane secret missing: set the {} environment variable",
            config.api.api_secret_name
        );
    }
    if config.providers.is_empty() {
        bail!("no model providers configured; add a providers: list to the config");
    }

    let runtime = build_runtime(&config).await?;
    let shutdown = tokio_util::sync::CancellationToken::new();

    let worker = spawn_worker(
        Arc::clone(&runtime.queue),
        Arc::new(LogAdapter),
        shutdown.child_token(),
    );
    let timer =
        moray_incident::spawn_timer(Arc::clone(&runtime.incidents), shutdown.child_token());

    let state = AppState::new(
        secret.into_bytes(),
        config.api.auth_failures_per_minute,
        runtime.store.clone(),
        Arc::clone(&runtime.budget),
        Arc::clone(&runtime.router),
        Arc::clone(&runtime.queue),
        Arc::clone(&runtime.incidents),
        Arc::new(NotifySink {
            queue: Arc::clone(&runtime.queue),
        }),
    );

    tracing::info!(port = config.api.api_port, "moray gateway starting");
    let server = tokio::spawn(moray_gateway::serve(state, config.api.api_port));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    runtime.delegate.shutdown();
    shutdown.cancel();
    let _ = worker.await;
    let _ = timer.await;
    server.abort();
    Ok(())
}

async fn run_send(
    config: Arc<Config>,
    platform: &str,
    sender: &str,
    text: &str,
) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        bail!("no message text given");
    }
    let runtime = build_runtime(&config).await?;
    let reply = runtime
        .conversation
        .process_text(&format!("{platform}:{sender}"), text)
        .await?;
    println!("{reply}");
    Ok(())
}

async fn run_doctor(config: Arc<Config>) -> anyhow::Result<()> {
    let mut failures = 0;
    let mut check = |name: &str, ok: bool, detail: String| {
        let mark = if ok { "ok " } else { "FAIL" };
        println!("[{mark}] {name}: {detail}");
        if !ok {
            failures += 1;
        }
    };

    check(
        "providers",
        !config.providers.is_empty(),
        format!("{} configured", config.providers.len()),
    );
    for provider in &config.providers {
        let present = std::env::var(&provider.api_key_name)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        check(
            &format!("api key '{}'", provider.id),
            present,
            format!("env {}", provider.api_key_name),
        );
    }
    check(
        "control-plane secret",
        std::env::var(&config.api.api_secret_name)
            .map(|v| !v.is_empty())
            .unwrap_or(false),
        format!("env {}", config.api.api_secret_name),
    );

    let store_path = config
        .store_path
        .clone()
        .unwrap_or_else(|| "moray.db".into());
    match Store::open(&store_path).await {
        Ok(_) => check("store", true, store_path),
        Err(e) => check("store", false, format!("{store_path}: {e}")),
    }

    if failures > 0 {
        bail!("{failures} check(s) failed");
    }
    println!("all checks passed");
    Ok(())
}
