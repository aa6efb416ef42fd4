//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the relation DB and the staging directory

use crate::services::datastream_service::DatastreamService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 200 when the relation table answers and the staging directory is
/// readable and writable, 503 otherwise.
pub async fn readyz(State(service): State<DatastreamService>) -> impl IntoResponse {
    let relations = match service.relations().ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    let staging = staging_check(service.staging_dir()).await;

    let overall_ok = relations.ok && staging.ok;
    let mut checks = HashMap::new();
    checks.insert("relations", relations);
    checks.insert("staging", staging);

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Write, read back and delete a probe file under `dir`.
async fn staging_check(dir: &Path) -> CheckStatus {
    let probe = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, b"readyz").await {
        return CheckStatus::failed(format!("could not write probe file: {}", e));
    }
    let read = fs::read(&probe).await;
    let removed = fs::remove_file(&probe).await;
    match read {
        Ok(bytes) if bytes == b"readyz" => match removed {
            Ok(()) => CheckStatus::ok(),
            Err(e) => CheckStatus {
                ok: true,
                error: Some(format!("could not remove probe file: {}", e)),
            },
        },
        Ok(_) => CheckStatus::failed("probe file content mismatch".into()),
        Err(e) => CheckStatus::failed(format!("could not read probe file: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
