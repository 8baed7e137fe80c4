use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub workdir: CheckResult,
    pub bare_mirror: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_workdir(state: &AppState) -> CheckResult {
    let git_dir = state.sync.workdir().join(".git");
    if tokio::fs::metadata(&git_dir).await.is_ok() {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy("working tree is not a git repository")
    }
}

async fn check_bare_mirror(state: &AppState) -> CheckResult {
    let head = state.sync.bare().join("HEAD");
    match tokio::fs::metadata(&head).await {
        Ok(meta) if meta.is_file() => CheckResult::healthy(),
        _ => CheckResult::unhealthy("bare mirror not initialised"),
    }
}

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // The bare mirror is what clients talk to; without it the transport
    // surface cannot serve anything.
    if !checks.bare_mirror.ok {
        HealthStatus::Unhealthy
    } else if !checks.workdir.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (workdir, bare_mirror) =
        tokio::join!(check_workdir(&state), check_bare_mirror(&state));

    let checks = HealthChecks {
        workdir,
        bare_mirror,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bare_mirror_is_unhealthy() {
        let checks = HealthChecks {
            workdir: CheckResult::healthy(),
            bare_mirror: CheckResult::unhealthy("bare mirror not initialised"),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }

    #[test]
    fn invalid_workdir_is_degraded() {
        let checks = HealthChecks {
            workdir: CheckResult::unhealthy("working tree is not a git repository"),
            bare_mirror: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }

    #[test]
    fn all_ok() {
        let checks = HealthChecks {
            workdir: CheckResult::healthy(),
            bare_mirror: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Ok);
    }
}
