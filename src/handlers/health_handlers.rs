//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> write/read/delete round trip against the seeded bucket

use crate::{emulator::EmulatorState, models::object::ObjectUpload};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

const PROBE_BODY: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Never touches the store.
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
/// Stores, reads back and removes a throwaway object in the seeded bucket.
/// 200 when the round trip works, 503 otherwise.
pub async fn readyz(State(state): State<EmulatorState>) -> impl IntoResponse {
    let bucket = state.seed_bucket.as_str();
    let key = format!(".readyz-{}", Uuid::new_v4());

    let upload = ObjectUpload {
        key: key.clone(),
        content: Bytes::from_static(PROBE_BODY),
        content_type: "text/plain".into(),
        cache_control: None,
    };
    let round_trip = match state.store.put(bucket, upload) {
        Ok(_) => {
            let read = state.store.get(bucket, &key);
            let removed = state.store.remove(bucket, &key);
            match (read, removed) {
                (Err(err), _) => CheckStatus::error(format!("could not read object: {err}")),
                (Ok(blob), _) if blob.content.as_ref() != PROBE_BODY => {
                    CheckStatus::error("object content mismatch")
                }
                (Ok(_), Err(err)) => CheckStatus::error(format!("could not remove object: {err}")),
                (Ok(_), Ok(())) => CheckStatus::ok(),
            }
        }
        Err(err) => CheckStatus::error(format!("could not write object: {err}")),
    };

    let overall_ok = round_trip.ok;
    let mut checks = HashMap::new();
    checks.insert("store", round_trip);

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
        Self {
            ok: true,
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}
