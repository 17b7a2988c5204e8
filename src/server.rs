//! HTTP surface: OAuth consent redirect, provider callback and job status reads.

use std::net::SocketAddr;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::db::models::Provider;
use crate::error::IngestError;
use crate::sync::{SyncCredential, SyncOrchestrator, SyncRequest};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SyncOrchestrator,
    /// Where the browser lands after a callback; gets `?job_id=<id>` appended.
    pub post_sync_redirect: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/oauth/:provider/authorize", get(authorize))
        .route("/oauth/:provider/callback", get(oauth_callback))
        .route("/jobs/:job_id/status", get(job_status))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "labsync listening");
    axum::serve(listener, router(state))
        .await
        .context("http server stopped")?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    user_id: Option<String>,
}

/// GET /oauth/:provider/authorize?user_id=...
async fn authorize(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    let Some(provider) = configured_provider(&state, &provider) else {
        return (StatusCode::NOT_FOUND, "Unknown mailbox provider").into_response();
    };

    let user_id = match params.user_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => return (StatusCode::BAD_REQUEST, "Missing user_id").into_response(),
    };

    match state.orchestrator.registry().get(provider) {
        Some(entry) => Redirect::temporary(&entry.broker.authorization_url(&user_id)).into_response(),
        None => (StatusCode::NOT_FOUND, "Unknown mailbox provider").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// GET /oauth/:provider/callback?code=...&state=...
async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        return (
            StatusCode::BAD_REQUEST,
            format!("Mailbox authorization failed: {error}"),
        )
            .into_response();
    }

    let Some(provider) = configured_provider(&state, &provider) else {
        return (StatusCode::NOT_FOUND, "Unknown mailbox provider").into_response();
    };

    let (code, user_id) = match (params.code, params.state) {
        (Some(code), Some(user_id)) if !code.is_empty() && !user_id.is_empty() => (code, user_id),
        _ => return (StatusCode::BAD_REQUEST, "Missing OAuth code or state").into_response(),
    };

    let request = SyncRequest {
        user_id,
        provider,
        credential: SyncCredential::AuthorizationCode(code),
    };

    let ticket = match state.orchestrator.start(request) {
        Ok(ticket) => ticket,
        Err(error @ IngestError::SyncInProgress { .. }) => {
            return (StatusCode::CONFLICT, error.to_string()).into_response();
        }
        Err(IngestError::ProviderNotConfigured(_)) => {
            return (StatusCode::NOT_FOUND, "Unknown mailbox provider").into_response();
        }
        Err(error) => {
            warn!(%provider, %error, "could not start sync job");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Could not start sync").into_response();
        }
    };

    match &state.post_sync_redirect {
        Some(target) => Redirect::to(&with_job_id(target, &ticket.job_id)).into_response(),
        None => (
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": ticket.job_id, "status": "queued" })),
        )
            .into_response(),
    }
}

/// GET /jobs/:job_id/status
async fn job_status(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let tracker = state.orchestrator.tracker();
    let rows = match tracker.job_rows(&job_id) {
        Ok(rows) => rows,
        Err(error) => {
            warn!(%job_id, %error, "status read failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Could not read job status").into_response();
        }
    };
    if rows.is_empty() {
        return (StatusCode::NOT_FOUND, "Unknown job").into_response();
    }

    let latest = tracker.latest_per_step(&job_id).unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({ "job_id": job_id, "rows": rows, "latest": latest })),
    )
        .into_response()
}

fn configured_provider(state: &AppState, raw: &str) -> Option<Provider> {
    let provider: Provider = raw.parse().ok()?;
    state
        .orchestrator
        .registry()
        .get(provider)
        .map(|_| provider)
}

fn with_job_id(target: &str, job_id: &str) -> String {
    match Url::parse(target) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("job_id", job_id);
            url.to_string()
        }
        Err(_) => {
            let separator = if target.contains('?') { '&' } else { '?' };
            format!("{target}{separator}job_id={job_id}")
        }
    }
}
