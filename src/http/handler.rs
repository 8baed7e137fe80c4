//! Axum router and HTTP request handlers for the transport gate.
//!
//! Routes:
//! - `GET  /api/v1/git/{repo}/info/refs`        - smart HTTP ref advertisement
//! - `POST /api/v1/git/{repo}/git-upload-pack`  - fetch/clone data transfer
//! - `POST /api/v1/git/{repo}/git-receive-pack` - push; triggers replay+build
//! - `POST /api/v1/git-build`                   - manual build trigger (202)
//! - `GET  /healthz`                            - health check
//! - `GET  /metrics`                            - Prometheus metrics
//!
//! Exactly one bare repository is served; any other `{repo}` is 404.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{authorize, AccessOp};
use crate::git::commands::{git_advertise_refs, git_serve_rpc, GitService};
use crate::http::pktline;
use crate::metrics::{SyncDirection, SyncLabels};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Git smart HTTP protocol endpoints
        .route("/api/v1/git/{repo}/info/refs", get(handle_info_refs))
        .route(
            "/api/v1/git/{repo}/git-upload-pack",
            post(handle_upload_pack),
        )
        .route(
            "/api/v1/git/{repo}/git-receive-pack",
            post(handle_receive_pack),
        )
        // Build trigger
        .route("/api/v1/git-build", post(handle_build_trigger))
        // Health, metrics
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/v1/git/{repo}/info/refs?service=git-upload-pack`
///
/// Authorizes the caller (which, for fetches, first refreshes the bare
/// mirror from the working tree) and answers with the framed ref
/// advertisement for the requested service.
#[instrument(skip(state, headers), fields(%repo))]
async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_repo_name(&state, &repo)?;

    let service = query.service.unwrap_or_default();
    let (git_service, op) = match service.as_str() {
        "git-upload-pack" => (GitService::UploadPack, AccessOp::Fetch),
        "git-receive-pack" => (GitService::ReceivePack, AccessOp::Push),
        other => {
            return Ok((
                StatusCode::BAD_REQUEST,
                format!("unsupported service: {other}"),
            )
                .into_response());
        }
    };

    authorize_or_deny(&state, &headers, op).await?;

    let advert = git_advertise_refs(state.sync.bare(), git_service)
        .await
        .map_err(AppError::Internal)?;
    let body = pktline::service_advertisement(git_service.name(), &advert);

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("application/x-{}-advertisement", git_service.name()),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response())
}

/// `POST /api/v1/git/{repo}/git-upload-pack`
///
/// The preceding authorization already guaranteed mirror freshness; this
/// just pipes the negotiation through a local `git upload-pack`.
#[instrument(skip(state, headers, body), fields(%repo))]
async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_repo_name(&state, &repo)?;
    authorize_or_deny(&state, &headers, AccessOp::Fetch).await?;
    state.metrics.fetch_total.inc();

    let output = git_serve_rpc(state.sync.bare(), GitService::UploadPack, &body)
        .await
        .map_err(AppError::Internal)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-git-upload-pack-result")],
        output,
    )
        .into_response())
}

/// `POST /api/v1/git/{repo}/git-receive-pack`
///
/// Pushes are always accepted without content inspection.  Once the
/// subprocess completes, the pushed branch commit is replayed onto the
/// working tree and a build run is enqueued -- fire-and-forget relative to
/// the response; replay and build failures are only logged.
#[instrument(skip(state, headers, body), fields(%repo))]
async fn handle_receive_pack(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_repo_name(&state, &repo)?;
    authorize_or_deny(&state, &headers, AccessOp::Push).await?;
    state.metrics.push_total.inc();

    // Learn the pushed branch/commit before the body is consumed.
    let updates = pktline::parse_ref_updates(&body);

    let output = git_serve_rpc(state.sync.bare(), GitService::ReceivePack, &body)
        .await
        .map_err(AppError::Internal)?;

    // A push with no branch commit (e.g. a deletion) is a no-op.
    let replay = updates
        .iter()
        .rev()
        .find(|u| u.branch().is_some() && !u.is_delete())
        .cloned();

    match replay {
        Some(update) => {
            let branch = update.branch().unwrap_or_default().to_string();
            let commit = update.new_oid.clone();
            info!(%branch, %commit, "push accepted; scheduling replay");

            let state = Arc::clone(&state);
            tokio::spawn(async move {
                match state.sync.sync_bare_to_workdir(&branch, &commit).await {
                    Ok(()) => {
                        state
                            .metrics
                            .sync_total
                            .get_or_create(&SyncLabels {
                                direction: SyncDirection::BareToWorkdir,
                            })
                            .inc();
                    }
                    Err(err) => {
                        error!(error = %err, %branch, %commit, "push replay failed");
                        return;
                    }
                }
                if let Err(err) = state.build.run().await {
                    warn!(error = %err, "build after push did not complete");
                }
            });
        }
        None => debug!("push carried no branch commit; skipping replay"),
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-git-receive-pack-result")],
        output,
    )
        .into_response())
}

/// `POST /api/v1/git-build`
///
/// Acknowledges immediately with 202; the run itself is asynchronous and
/// its outcome is reported through the completion callback and metrics.
#[instrument(skip(state, headers))]
async fn handle_build_trigger(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize_or_deny(&state, &headers, AccessOp::Manage).await?;

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = state.build.run().await {
                warn!(error = %err, "triggered build did not complete");
            }
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "build started - progress is reported asynchronously",
        })),
    )
        .into_response())
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Only the configured bare repository is served, with or without the
/// `.git` suffix.
fn check_repo_name(state: &AppState, requested: &str) -> Result<(), AppError> {
    if repo_name_matches(&state.config.repos.bare_name, requested) {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("unknown repository: {requested}")))
    }
}

fn repo_name_matches(configured: &str, requested: &str) -> bool {
    requested == configured || requested.strip_suffix(".git") == Some(configured)
}

async fn authorize_or_deny(
    state: &AppState,
    headers: &HeaderMap,
    op: AccessOp,
) -> Result<(), AppError> {
    match authorize(state, headers, op).await {
        Ok(claims) => {
            debug!(sub = %claims.sub, ?op, "request authorized");
            Ok(())
        }
        Err(err) => {
            state.metrics.auth_denied_total.inc();
            warn!(reason = %err, ?op, "request denied");
            Err(AppError::Unauthorized(err.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The caller is not authenticated or not authorised.
    Unauthorized(String),
    /// The requested repository is not the one this server exposes.
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer realm=\"forgebench\"")],
                msg,
            )
                .into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_matching() {
        assert!(repo_name_matches("bare", "bare"));
        assert!(repo_name_matches("bare", "bare.git"));
        assert!(!repo_name_matches("bare", "other"));
        assert!(!repo_name_matches("bare", "other.git"));
        assert!(!repo_name_matches("bare", "bare.git.git.git"));
    }

    #[test]
    fn unauthorized_response_has_challenge_header() {
        let response = AppError::Unauthorized("token revoked".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer realm=\"forgebench\"")
        );
    }

    #[test]
    fn not_found_response() {
        let response = AppError::NotFound("unknown repository: x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
