//! Recognition service: verification requests and store reloads.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::HttpError;
use crate::{
    errors::AppError,
    matcher::{AccessLogEntry, AccessVerifier, Verification},
    store::StoreSpec,
};

pub struct ServeState {
    pub verifier: Arc<AccessVerifier>,
    pub spec: StoreSpec,
    pub model_name: String,
}

pub fn router(state: ServeState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/api/recognize", post(recognize))
        .route("/api/database/reload", post(reload))
        .route("/api/database/info", get(database_info))
        .route("/api/access_log", get(access_log))
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .with_state(Arc::new(state))
}

#[derive(Deserialize)]
pub struct RecognizeRequest {
    pub image_base64: String,
    pub threshold: Option<f32>,
}

impl std::fmt::Debug for RecognizeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RecognizeRequest {{ image_base64: [REDACTED], threshold: {:?} }}",
            self.threshold
        )
    }
}

#[derive(Serialize)]
pub struct RecognizeResponse {
    pub success: bool,
    pub access_granted: bool,
    #[serde(flatten)]
    pub verification: Verification,
}

/// Decode base64 image data, tolerating a `data:<mime>;base64,` prefix.
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>, AppError> {
    let data = match payload.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    Ok(STANDARD.decode(data.trim())?)
}

async fn index() -> Json<Value> {
    Json(json!({
        "service": "facegate",
        "endpoints": [
            "POST /api/recognize",
            "POST /api/database/reload",
            "GET /api/database/info",
            "GET /api/access_log",
            "GET /api/health",
        ],
    }))
}

async fn health(State(state): State<Arc<ServeState>>) -> Json<Value> {
    let store = state.verifier.store().current();
    Json(json!({
        "status": "ok",
        "identities": store.len(),
        "store_kind": store.kind(),
        "model": state.model_name,
    }))
}

async fn recognize(
    State(state): State<Arc<ServeState>>,
    Json(payload): Json<RecognizeRequest>,
) -> Result<Json<RecognizeResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    if let Some(threshold) = payload.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AppError::BadRequest(format!(
                "threshold must be between 0.0 and 1.0, got {threshold}"
            ))
            .into());
        }
    }

    let bytes = decode_image_payload(&payload.image_base64)?;
    let verifier = state.verifier.clone();

    tokio::task::block_in_place(move || {
        let verification = verifier.verify_bytes(&bytes, payload.threshold)?;
        Ok(Json(RecognizeResponse {
            success: true,
            access_granted: verification.granted(),
            verification,
        }))
    })
}

async fn reload(State(state): State<Arc<ServeState>>) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let count = state.verifier.store().reload(&state.spec)?;
        Ok(Json(json!({
            "success": true,
            "num_identities": count,
            "message": format!("Database reloaded with {count} identities"),
        })))
    })
}

#[derive(Serialize)]
struct IdentityInfo {
    name: String,
    image_count: u32,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

async fn database_info(State(state): State<Arc<ServeState>>) -> Json<Value> {
    let store = state.verifier.store().current();
    let identities: Vec<IdentityInfo> = store
        .identities()
        .into_iter()
        .map(|identity| IdentityInfo {
            name: identity.name.clone(),
            image_count: identity.image_count,
            description: identity.description.clone(),
            created_at: identity.created_at,
            updated_at: identity.updated_at,
        })
        .collect();

    Json(json!({
        "num_identities": identities.len(),
        "kind": store.kind(),
        "dimensions": store.dimensions(),
        "path": store.path().display().to_string(),
        "recognition_threshold": state.verifier.recognition_threshold(),
        "identities": identities,
    }))
}

#[derive(Deserialize)]
struct AccessLogQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct AccessLogResponse {
    entries: Vec<AccessLogEntry>,
    granted: usize,
    denied: usize,
}

async fn access_log(
    State(state): State<Arc<ServeState>>,
    Query(query): Query<AccessLogQuery>,
) -> Json<AccessLogResponse> {
    let log = state.verifier.access_log();
    let (granted, denied) = log.summary();
    Json(AccessLogResponse {
        entries: log.recent(query.limit),
        granted,
        denied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_image_payload_strips_data_url() {
        let encoded = STANDARD.encode(b"abc");
        assert_eq!(decode_image_payload(&encoded).unwrap(), b"abc");
        assert_eq!(
            decode_image_payload(&format!("data:image/png;base64,{encoded}")).unwrap(),
            b"abc"
        );
        assert!(matches!(
            decode_image_payload("not base64!"),
            Err(AppError::Base64(_))
        ));
    }
}
