//! Bearer-token authorization for the transport gate.
//!
//! A fetch-type access first brings the bare mirror up to date (failures are
//! swallowed -- staleness is preferred over a failed request), then every
//! access validates the token: present, not revoked, correctly signed, not
//! expired, and carrying the required capability.  Finding a revoked token
//! opportunistically prunes expired revocation/refresh rows as a best-effort
//! side effect.

pub mod store;
pub mod token;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::http::HeaderMap;
use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use crate::auth::token::Claims;
use crate::metrics::{SyncDirection, SyncLabels};
use crate::sync::engine::SyncOutcome;
use crate::AppState;

/// What the caller is trying to do; fetch-type access triggers the
/// pre-serve sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    /// fetch/clone over smart HTTP
    Fetch,
    /// push over smart HTTP
    Push,
    /// management endpoints (build trigger)
    Manage,
}

/// Decide whether the request may proceed; returns the verified claims or an
/// error whose message is the denial reason.
#[instrument(skip(state, headers), fields(?op))]
pub async fn authorize(state: &AppState, headers: &HeaderMap, op: AccessOp) -> Result<Claims> {
    if op == AccessOp::Fetch {
        // Completed before the allow/deny decision; a failure never blocks
        // the request.
        match state.sync.sync_workdir_to_bare().await {
            Ok(outcome) => {
                if matches!(outcome, SyncOutcome::Synced { .. }) {
                    state
                        .metrics
                        .sync_total
                        .get_or_create(&SyncLabels {
                            direction: SyncDirection::WorkdirToBare,
                        })
                        .inc();
                }
                debug!(?outcome, "pre-fetch sync finished");
            }
            Err(err) => {
                error!(error = %err, "pre-fetch sync failed; serving possibly stale mirror");
            }
        }
    }

    let Some(raw_token) = token::extract_bearer(headers, &state.config.auth.alt_header) else {
        bail!("missing bearer token");
    };

    let hash = token::token_hash(&raw_token);
    let revoked = {
        let tokens = Arc::clone(&state.tokens);
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || tokens.is_revoked(&hash))
            .await
            .context("revocation lookup task failed")??
    };

    if revoked {
        // Best-effort cleanup, not transactional with the decision.
        let tokens = Arc::clone(&state.tokens);
        tokio::task::spawn_blocking(move || {
            let now = Utc::now().timestamp();
            match tokens.purge_expired(now) {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "pruned expired token records"),
                Err(err) => warn!(error = %err, "failed to prune expired token records"),
            }
        });
        bail!("token revoked");
    }

    let claims = token::verify_token(&raw_token, &state.auth_secret)?;

    if !claims.has_capability(&state.config.auth.required_capability) {
        bail!("permission denied");
    }

    Ok(claims)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::TokenStore;
    use crate::auth::token::{sign_token, token_hash};
    use crate::build::BuildRunner;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use crate::sync::engine::Synchronizer;
    use axum::http::header;
    use std::time::Duration;
    use tempfile::TempDir;

    const SECRET: &[u8] = b"unit-test-secret";

    fn test_state(tmp: &TempDir) -> AppState {
        let yaml = format!(
            "repos:\n  root: {root}\n  workdir: {workdir}\n",
            root = tmp.path().join("repos").display(),
            workdir = tmp.path().join("workdir").display(),
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let config = Arc::new(config);

        let sync = Arc::new(Synchronizer::new(
            config.repos.workdir_path(),
            config.repos.bare_path(),
            config.repos.default_branch.clone(),
            Duration::from_millis(0),
        ));
        let build = Arc::new(BuildRunner::new(
            config.repos.workdir_path(),
            config.build.clone(),
        ));

        AppState {
            config,
            auth_secret: Arc::new(SECRET.to_vec()),
            tokens: Arc::new(TokenStore::open_in_memory().unwrap()),
            sync,
            build,
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers
    }

    fn valid_claims() -> Claims {
        Claims {
            sub: "user-1".to_string(),
            capabilities: vec!["manage_workdir".to_string()],
            exp: Utc::now().timestamp() + 3600,
        }
    }

    #[tokio::test]
    async fn missing_token_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&tmp);

        let err = authorize(&state, &HeaderMap::new(), AccessOp::Push)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing bearer token");
    }

    #[tokio::test]
    async fn valid_token_is_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&tmp);
        let token = sign_token(&valid_claims(), SECRET).unwrap();

        let claims = authorize(&state, &bearer(&token), AccessOp::Push)
            .await
            .unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[tokio::test]
    async fn revoked_token_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&tmp);
        let token = sign_token(&valid_claims(), SECRET).unwrap();
        state
            .tokens
            .revoke(&token_hash(&token), Utc::now().timestamp() + 3600)
            .unwrap();

        let err = authorize(&state, &bearer(&token), AccessOp::Push)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "token revoked");
    }

    #[tokio::test]
    async fn missing_capability_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&tmp);
        let mut claims = valid_claims();
        claims.capabilities = vec!["something_else".to_string()];
        let token = sign_token(&claims, SECRET).unwrap();

        let err = authorize(&state, &bearer(&token), AccessOp::Push)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "permission denied");
    }

    #[tokio::test]
    async fn fetch_sync_failure_is_swallowed() {
        // The workdir is not a git repository, so the pre-fetch sync errors;
        // authorization must still complete on the token alone.
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&tmp);
        std::fs::create_dir_all(state.sync.workdir()).unwrap();
        let token = sign_token(&valid_claims(), SECRET).unwrap();

        let claims = authorize(&state, &bearer(&token), AccessOp::Fetch)
            .await
            .unwrap();
        assert_eq!(claims.sub, "user-1");
    }
}
