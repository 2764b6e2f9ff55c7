//! Enrollment management and rebuild control.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{serve::decode_image_payload, HttpError};
use crate::{
    enrollment::{EnrollmentTree, IdentitySummary, PersonInfo, Upload},
    rebuild::{RebuildOrchestrator, RebuildStatus, TriggerSource},
};

pub struct AdminState {
    pub tree: EnrollmentTree,
    pub orchestrator: RebuildOrchestrator,
    pub store_path: PathBuf,
    pub log_tail_bytes: usize,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/identities", get(identities))
        .route("/api/person/:name", get(person))
        .route("/images/:person/:filename", get(image))
        .route("/api/enroll", post(enroll))
        .route("/api/add_image", post(add_image))
        .route("/api/delete_image", post(delete_image))
        .route("/api/delete_person", post(delete_person))
        .route("/api/rebuild_db", post(rebuild_db))
        .route("/api/rebuild_status", get(rebuild_status))
        .route("/api/latest_log", get(latest_log))
        .route("/api/stats", get(stats))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .with_state(Arc::new(state))
}

fn default_auto_rebuild() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ImagePayload {
    pub filename: String,
    pub data_b64: String,
}

impl std::fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImagePayload {{ filename: {:?}, data_b64: [REDACTED] }}", self.filename)
    }
}

impl ImagePayload {
    fn into_upload(self) -> Result<Upload, HttpError> {
        Ok(Upload {
            data: decode_image_payload(&self.data_b64)?,
            filename: self.filename,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub images: Vec<ImagePayload>,
    #[serde(default = "default_auto_rebuild")]
    pub auto_rebuild: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddImageRequest {
    pub person: String,
    #[serde(flatten)]
    pub image: ImagePayload,
    #[serde(default = "default_auto_rebuild")]
    pub auto_rebuild: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteImageRequest {
    pub person: String,
    pub filename: String,
    #[serde(default = "default_auto_rebuild")]
    pub auto_rebuild: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeletePersonRequest {
    pub person: String,
    #[serde(default = "default_auto_rebuild")]
    pub auto_rebuild: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    pub message: String,
    pub person: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images_saved: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild_started: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild_message: Option<String>,
}

impl MutationResponse {
    fn maybe_rebuild(mut self, state: &AdminState, enabled: bool, source: TriggerSource) -> Self {
        if enabled {
            let outcome = state.orchestrator.trigger(source);
            self.rebuild_started = Some(outcome.accepted);
            self.rebuild_message = Some(outcome.message);
        }
        self
    }
}

async fn identities(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let identities: Vec<IdentitySummary> = state.tree.list_identities()?;
        Ok(Json(json!({ "identities": identities })))
    })
}

async fn person(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
) -> Result<Json<PersonInfo>, HttpError> {
    tokio::task::block_in_place(move || Ok(Json(state.tree.person(&name)?)))
}

async fn image(
    State(state): State<Arc<AdminState>>,
    Path((person, filename)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    tokio::task::block_in_place(move || {
        let (data, mime) = state.tree.read_image(&person, &filename)?;
        Ok(([(header::CONTENT_TYPE, mime)], data).into_response())
    })
}

async fn enroll(
    State(state): State<Arc<AdminState>>,
    Json(payload): Json<EnrollRequest>,
) -> Result<Json<MutationResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let uploads = payload
            .images
            .into_iter()
            .map(ImagePayload::into_upload)
            .collect::<Result<Vec<_>, _>>()?;

        let outcome = state
            .tree
            .enroll(&payload.name, &payload.description, &uploads)?;
        let person = payload.name.trim().to_string();
        let saved = outcome.saved.len();

        let response = MutationResponse {
            success: true,
            message: format!("Saved {saved} images for {person}"),
            person,
            images_saved: Some(saved),
            rejected: outcome.rejected,
            ..Default::default()
        };
        Ok(Json(response.maybe_rebuild(
            &state,
            payload.auto_rebuild && saved > 0,
            TriggerSource::Enroll,
        )))
    })
}

async fn add_image(
    State(state): State<Arc<AdminState>>,
    Json(payload): Json<AddImageRequest>,
) -> Result<Json<MutationResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let upload = payload.image.into_upload()?;
        let stored = state.tree.add_image(&payload.person, &upload)?;
        let person = payload.person.trim().to_string();

        let response = MutationResponse {
            success: true,
            message: format!("Added image to {person}"),
            person,
            filename: Some(stored),
            ..Default::default()
        };
        Ok(Json(response.maybe_rebuild(
            &state,
            payload.auto_rebuild,
            TriggerSource::AddImage,
        )))
    })
}

async fn delete_image(
    State(state): State<Arc<AdminState>>,
    Json(payload): Json<DeleteImageRequest>,
) -> Result<Json<MutationResponse>, HttpError> {
    tokio::task::block_in_place(move || {
        state.tree.delete_image(&payload.person, &payload.filename)?;
        let person = payload.person.trim().to_string();
        let filename = payload.filename.trim().to_string();

        let response = MutationResponse {
            success: true,
            message: format!("Deleted {filename} from {person}"),
            person,
            filename: Some(filename),
            ..Default::default()
        };
        Ok(Json(response.maybe_rebuild(
            &state,
            payload.auto_rebuild,
            TriggerSource::DeleteImage,
        )))
    })
}

async fn delete_person(
    State(state): State<Arc<AdminState>>,
    Json(payload): Json<DeletePersonRequest>,
) -> Result<Json<MutationResponse>, HttpError> {
    tokio::task::block_in_place(move || {
        state.tree.delete_person(&payload.person)?;
        let person = payload.person.trim().to_string();

        let response = MutationResponse {
            success: true,
            message: format!("Deleted {person}"),
            person,
            ..Default::default()
        };
        Ok(Json(response.maybe_rebuild(
            &state,
            payload.auto_rebuild,
            TriggerSource::Delete,
        )))
    })
}

async fn rebuild_db(State(state): State<Arc<AdminState>>) -> Response {
    let outcome = state.orchestrator.trigger(TriggerSource::Manual);
    if outcome.accepted {
        Json(json!({
            "success": true,
            "message": outcome.message,
            "status": outcome.status,
        }))
        .into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": outcome.message,
                "status": outcome.status,
            })),
        )
            .into_response()
    }
}

async fn rebuild_status(State(state): State<Arc<AdminState>>) -> Json<RebuildStatus> {
    Json(state.orchestrator.status())
}

async fn latest_log(State(state): State<Arc<AdminState>>) -> Json<Value> {
    tokio::task::block_in_place(move || {
        match state.orchestrator.latest_log(state.log_tail_bytes) {
            Some((filename, content)) => Json(json!({ "content": content, "filename": filename })),
            None => Json(json!({ "content": "No logs found" })),
        }
    })
}

#[derive(Serialize)]
struct DatabaseFileInfo {
    exists: bool,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

async fn stats(State(state): State<Arc<AdminState>>) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let identities = state.tree.list_identities()?;
        let total_images: usize = identities.iter().map(|identity| identity.image_count).sum();

        let metadata = std::fs::metadata(&state.store_path).ok();
        let database = DatabaseFileInfo {
            exists: metadata.is_some(),
            size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
        };

        Ok(Json(json!({
            "total_identities": identities.len(),
            "total_images": total_images,
            "database": database,
            "rebuild_status": state.orchestrator.status(),
        })))
    })
}
