//! Access verification: image in, identity decision out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::face::{self, FaceError, FaceModel};
use crate::store::{ScoredName, StoreError, StoreHandle};

pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Granted,
    NoMatch,
    NoFace,
    EmbeddingFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    /// Matched name or `Unknown`
    pub person_name: String,
    pub score: f32,
    pub access_granted: bool,
    pub detection_score: f32,
    pub outcome: Outcome,
}

/// Bounded in-memory record of verification attempts. The oldest entry is
/// dropped once `capacity` is reached.
pub struct AccessLog {
    capacity: usize,
    entries: Mutex<VecDeque<AccessLogEntry>>,
}

impl AccessLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1024))),
        }
    }

    pub fn push(&self, entry: AccessLogEntry) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The most recent `limit` entries (all when `None`), oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<AccessLogEntry> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));
        entries.iter().skip(skip).cloned().collect()
    }

    /// `(granted, denied)` over the retained entries.
    pub fn summary(&self) -> (usize, usize) {
        let entries = self.recent(None);
        let granted = entries.iter().filter(|entry| entry.access_granted).count();
        (granted, entries.len() - granted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub name: Option<String>,
    pub score: f32,
    pub top_matches: Vec<ScoredName>,
    pub outcome: Outcome,
    pub detection_score: f32,
    pub face_bbox: Option<[f32; 4]>,
    pub description: Option<String>,
}

impl Verification {
    fn rejected(outcome: Outcome) -> Self {
        Self {
            name: None,
            score: 0.0,
            top_matches: Vec::new(),
            outcome,
            detection_score: 0.0,
            face_bbox: None,
            description: None,
        }
    }

    pub fn granted(&self) -> bool {
        self.name.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Image(#[from] FaceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AccessVerifier {
    store: StoreHandle,
    model: Arc<dyn FaceModel>,
    detection_threshold: f32,
    recognition_threshold: f32,
    top_k: usize,
    log: AccessLog,
}

impl AccessVerifier {
    pub fn new(
        store: StoreHandle,
        model: Arc<dyn FaceModel>,
        detection_threshold: f32,
        recognition_threshold: f32,
        top_k: usize,
        log_capacity: usize,
    ) -> Self {
        Self {
            store,
            model,
            detection_threshold,
            recognition_threshold,
            top_k,
            log: AccessLog::new(log_capacity),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn access_log(&self) -> &AccessLog {
        &self.log
    }

    pub fn recognition_threshold(&self) -> f32 {
        self.recognition_threshold
    }

    /// Decode and verify raw image bytes.
    pub fn verify_bytes(
        &self,
        bytes: &[u8],
        threshold: Option<f32>,
    ) -> Result<Verification, VerifyError> {
        let image = face::decode_image(bytes)?;
        Ok(self.verify(&image, threshold)?)
    }

    /// Detect the largest face, embed it and match it against the live store.
    /// Every call, whatever its outcome, lands in the access log.
    pub fn verify(
        &self,
        image: &DynamicImage,
        threshold: Option<f32>,
    ) -> Result<Verification, StoreError> {
        let store = self.store.current();
        let threshold = threshold.unwrap_or(self.recognition_threshold);

        let analyzed = face::analyze(
            self.model.as_ref(),
            image,
            self.detection_threshold,
            store.dimensions(),
        );

        let found = match analyzed {
            Ok(found) => found,
            Err(FaceError::NoFace) => {
                log::debug!("no face above detection threshold {}", self.detection_threshold);
                return Ok(self.record(Verification::rejected(Outcome::NoFace)));
            }
            Err(err @ (FaceError::Detection(_) | FaceError::Decode(_))) => {
                log::warn!("face detection failed: {err}");
                return Ok(self.record(Verification::rejected(Outcome::NoFace)));
            }
            Err(FaceError::Embedding(reason)) => {
                log::warn!("embedding extraction failed: {reason}");
                return Ok(self.record(Verification::rejected(Outcome::EmbeddingFailed)));
            }
        };

        let best = store.find_match(&found.embedding, threshold)?;
        let top_matches = store.top_scores(&found.embedding, self.top_k)?;
        let description = best
            .name
            .as_deref()
            .and_then(|name| store.get(name))
            .and_then(|identity| identity.description.clone());

        let outcome = if best.name.is_some() {
            Outcome::Granted
        } else {
            Outcome::NoMatch
        };

        Ok(self.record(Verification {
            name: best.name,
            score: best.score,
            top_matches,
            outcome,
            detection_score: found.face.det_score,
            face_bbox: Some(found.face.bbox),
            description,
        }))
    }

    fn record(&self, verification: Verification) -> Verification {
        let person_name = verification.name.clone().unwrap_or_else(|| UNKNOWN.to_string());
        let status = if verification.granted() { "GRANTED" } else { "DENIED" };
        log::info!(
            "access {status} - person: {person_name}, score: {:.4}",
            verification.score
        );

        self.log.push(AccessLogEntry {
            timestamp: Utc::now(),
            person_name,
            score: verification.score,
            access_granted: verification.granted(),
            detection_score: verification.detection_score,
            outcome: verification.outcome,
        });
        verification
    }
}
