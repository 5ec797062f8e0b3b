//! Tracelens HTTP surface
//!
//! Axum server with two faces:
//! - the analysis API: start an analysis for a captured chain key and stream
//!   cumulative output as server-sent events, plus health/version and
//!   chain-store introspection
//! - everything else falls through to the observing reverse proxy (see
//!   `proxy`), which is how the chain stores get populated
//!
//! Architecture: each non-streaming endpoint has a thin axum handler that
//! delegates to a directly testable inner function.
//!
//! Endpoints:
//! - GET  /health         — upstream reachability + LLM config presence
//! - GET  /version        — server version info
//! - GET  /chains         — captured chain keys with category labels
//! - GET  /chains/{guid}  — single captured chain summary
//! - POST /analyze        — start an analysis, respond with an SSE stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use tracelens_core::models::AnalysisSession;
use tracelens_core::{
    ChatClient, ChatConfig, ExchangeObserver, TraceCorrelator, TracelensConfig,
};

use crate::proxy;
use crate::subsystems::analysis::{run_analysis, AnalysisUpdate, SessionRegistry};

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub config: TracelensConfig,
    pub correlator: Arc<TraceCorrelator>,
    /// The tap's view of the correlator.
    pub observer: Arc<dyn ExchangeObserver>,
    /// Client the proxy forwards upstream requests with.
    pub upstream: reqwest::Client,
    pub sessions: SessionRegistry,
}

impl HttpState {
    pub fn from_config(config: TracelensConfig) -> Result<Arc<Self>> {
        let correlator = Arc::new(TraceCorrelator::new(
            config.upstream.detail_path.clone(),
            config.upstream.search_path.clone(),
        ));
        let upstream = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream.timeout_seconds))
            .build()?;

        Ok(Arc::new(Self {
            observer: correlator.clone(),
            correlator,
            upstream,
            sessions: SessionRegistry::new(),
            config,
        }))
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/chains", get(chains_handler))
        .route("/chains/:guid", get(chain_detail_handler))
        .route("/analyze", post(analyze_handler))
        .fallback(proxy::proxy_handler)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    config: TracelensConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = HttpState::from_config(config)?;

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Tracelens HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub guid: String,
    /// Category focus. Absent means "all categories captured for this key";
    /// an explicit empty list means no focus clause.
    pub categories: Option<Vec<String>>,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — probes the upstream and reports LLM config presence.
pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    let llm_configured = ChatClient::new(ChatConfig::from(&state.config.llm)).is_ok();

    match state
        .upstream
        .get(&state.config.upstream.base_url)
        .send()
        .await
    {
        Ok(response) => {
            let live_session = state
                .sessions
                .current()
                .map(|(id, chain_key)| serde_json::json!({ "id": id, "chain_key": chain_key }));
            (
                StatusCode::OK,
                serde_json::json!({
                    "status": "healthy",
                    "version": env!("CARGO_PKG_VERSION"),
                    "upstream": {
                        "url": state.config.upstream.base_url,
                        "status": response.status().as_u16(),
                    },
                    "llm_configured": llm_configured,
                    "captured_chains": state.correlator.chain_keys().len(),
                    "live_session": live_session,
                }),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
                "llm_configured": llm_configured,
            }),
        ),
    }
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "tracelens/1",
    })
}

/// Inner chains listing.
pub fn chains_inner(state: &HttpState) -> serde_json::Value {
    let chains: Vec<serde_json::Value> = state
        .correlator
        .chain_keys()
        .into_iter()
        .map(|guid| {
            let categories = state.correlator.categories_for(&guid);
            serde_json::json!({ "guid": guid, "categories": categories })
        })
        .collect();

    serde_json::json!({ "count": chains.len(), "chains": chains })
}

/// Inner single-chain summary. 404 for keys that were never captured.
pub fn chain_detail_inner(state: &HttpState, guid: &str) -> (StatusCode, serde_json::Value) {
    match state.correlator.lookup(guid) {
        Some(raw) => {
            let steps = serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.get("data").and_then(|d| d.as_array().map(|a| a.len())));
            (
                StatusCode::OK,
                serde_json::json!({
                    "guid": guid,
                    "categories": state.correlator.categories_for(guid),
                    "steps": steps,
                    "bytes": raw.len(),
                }),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            serde_json::json!({
                "error": format!("No captured chain record for key {guid}"),
                "status": "error",
            }),
        ),
    }
}

/// Start an analysis session and return the sink channel's receiving end.
///
/// Replaces any live session (cancel-and-replace). Missing LLM configuration
/// short-circuits into a single Failed update without touching the network.
pub fn start_session(
    state: &Arc<HttpState>,
    guid: String,
    categories: Option<Vec<String>>,
) -> mpsc::Receiver<AnalysisUpdate> {
    let categories = categories.unwrap_or_else(|| state.correlator.categories_for(&guid));
    let (tx, rx) = mpsc::channel(32);

    match ChatClient::new(ChatConfig::from(&state.config.llm)) {
        Ok(client) => {
            let session = AnalysisSession::new(guid, categories);
            let id = session.id;
            let chain_key = session.chain_key.clone();
            let handle = tokio::spawn(run_analysis(
                session,
                state.correlator.clone(),
                Arc::new(client),
                tx,
            ));
            state.sessions.replace(id, chain_key, handle);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Analysis rejected: LLM configuration incomplete");
            let _ = tx.try_send(AnalysisUpdate::Failed {
                message: e.to_string(),
                partial: String::new(),
            });
        }
    }

    rx
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn chains_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(chains_inner(&state)))
}

pub async fn chain_detail_handler(
    State(state): State<Arc<HttpState>>,
    Path(guid): Path<String>,
) -> impl IntoResponse {
    let (status, body) = chain_detail_inner(&state, &guid);
    (status, Json(body))
}

pub async fn analyze_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = start_session(&state, req.guid, req.categories);

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|update| (Ok::<Event, Infallible>(sse_event(update)), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// Helpers
// ============================================================================

/// Map an analysis update onto a named SSE event with a JSON payload.
fn sse_event(update: AnalysisUpdate) -> Event {
    let (name, payload) = match update {
        AnalysisUpdate::Started { session } => (
            "session",
            serde_json::json!({
                "id": session.id,
                "guid": session.chain_key,
                "categories": session.categories,
                "state": session.state,
            }),
        ),
        AnalysisUpdate::Progress { text } => ("progress", serde_json::json!({ "text": text })),
        AnalysisUpdate::Done { text, prompt } => (
            "done",
            serde_json::json!({ "text": text, "prompt": prompt }),
        ),
        AnalysisUpdate::Failed { message, partial } => (
            "error",
            serde_json::json!({ "message": message, "partial": partial }),
        ),
    };

    Event::default()
        .event(name)
        .json_data(&payload)
        .unwrap_or_else(|e| {
            Event::default()
                .event("error")
                .data(format!("event serialization failed: {e}"))
        })
}

// ============================================================================
// Unit Tests — call inner functions directly
// ============================================================================
