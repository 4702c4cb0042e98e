//! MCP server initialization for stdio and HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that open the stores,
//! build the persona engine, start the scheduler and expose the MCP tools.

use crate::tools::{Outbox, PersonaTools};
use anyhow::{Context, Result};
use persona::config::PersonaConfig;
use persona::coordinator::llm::OpenAiClient;
use persona::coordinator::policy::ContinuationPolicy;
use persona::coordinator::sink::ChannelSink;
use persona::coordinator::{EngineConfig, PersonaEngine};
use persona::db::Store;
use persona::memory::decay::DecayEngine;
use persona::scheduler::{Scheduler, SchedulerHandle};
use rmcp::ServiceExt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Autonomous replies held for `take_replies` before new ones are refused.
const OUTBOX_CAPACITY: usize = 256;

struct SharedState {
    engine: Arc<PersonaEngine>,
    decay: DecayEngine,
    config: Arc<PersonaConfig>,
    outbox: Outbox,
}

/// Shared setup: open both stores, connect the analysis service, build the engine.
fn setup_shared_state(config: PersonaConfig) -> Result<SharedState> {
    let store = Store::open(&config).context("failed to open stores")?;
    tracing::info!(backend = %config.storage.backend, "stores ready");

    let client = Arc::new(
        OpenAiClient::new(config.analysis.clone()).context("failed to configure analysis service")?,
    );
    tracing::info!(model = %config.analysis.model, base_url = %config.analysis.base_url, "analysis service configured");

    let engine_config = EngineConfig::from_config(&config);
    let policy = Arc::new(ContinuationPolicy::new(config.policy.clone()));
    let (sink, outbox) = ChannelSink::new(OUTBOX_CAPACITY);
    let engine = Arc::new(PersonaEngine::new(
        store.clone(),
        client.clone(),
        client,
        policy,
        Arc::new(sink),
        engine_config,
    ));
    let decay = DecayEngine::new(store, config.decay.clone());

    Ok(SharedState {
        engine,
        decay,
        config: Arc::new(config),
        outbox: Arc::new(Mutex::new(outbox)),
    })
}

fn start_scheduler(state: &SharedState) -> SchedulerHandle {
    let decay = state.config.decay.enabled.then(|| state.decay.clone());
    if decay.is_none() {
        tracing::info!("scheduled decay disabled");
    }
    Scheduler::spawn(
        Arc::clone(&state.engine),
        decay,
        state.config.scheduler.clone(),
    )
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: PersonaConfig) -> Result<()> {
    tracing::info!("starting Persona MCP server on stdio");

    let state = setup_shared_state(config)?;
    let scheduler = start_scheduler(&state);

    let tools = PersonaTools::new(
        Arc::clone(&state.engine),
        state.decay.clone(),
        Arc::clone(&state.config),
        Arc::clone(&state.outbox),
    );
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    scheduler.shutdown().await;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP.
pub async fn serve_http(config: PersonaConfig) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let bind_addr = format!("{host}:{port}");

    tracing::info!(addr = %bind_addr, "starting Persona MCP server on HTTP");

    let state = setup_shared_state(config)?;
    let scheduler = start_scheduler(&state);

    let (engine, decay, config, outbox) = (
        Arc::clone(&state.engine),
        state.decay.clone(),
        Arc::clone(&state.config),
        Arc::clone(&state.outbox),
    );
    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(PersonaTools::new(engine.clone(), decay.clone(), config.clone(), outbox.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
