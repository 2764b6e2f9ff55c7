//! Face detection and embedding.
//!
//! The detector and embedder are external; [`FaceModel`] is the seam. Two
//! backends exist: `http` (a model service) and `pseudo` (a deterministic
//! stand-in for demos and tests).

mod http;
mod pseudo;

use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ModelBackend};
use crate::store;

pub use http::HttpFaceModel;
pub use pseudo::PseudoFaceModel;

#[derive(Debug, thiserror::Error)]
pub enum FaceError {
    #[error("no face detected")]
    NoFace,

    #[error("face detection failed: {0}")]
    Detection(String),

    #[error("embedding extraction failed: {0}")]
    Embedding(String),

    #[error("cannot decode image: {0}")]
    Decode(String),
}

/// A face found by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    /// `[x1, y1, x2, y2]` in pixels
    pub bbox: [f32; 4],
    pub det_score: f32,
    /// Some backends return the embedding together with the detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl DetectedFace {
    pub fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }
}

/// The face chosen in an image and its normalized embedding.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub face: DetectedFace,
    pub embedding: Vec<f32>,
}

pub trait FaceModel: Send + Sync {
    fn name(&self) -> &str;

    /// All faces in the image, any confidence.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, FaceError>;

    /// Embedding for one detected face. Need not be normalized.
    fn embed(&self, image: &DynamicImage, face: &DetectedFace) -> Result<Vec<f32>, FaceError>;
}

/// Build the configured backend.
pub fn from_config(config: &Config) -> anyhow::Result<Arc<dyn FaceModel>> {
    let model: Arc<dyn FaceModel> = match config.model.backend {
        ModelBackend::Http => Arc::new(HttpFaceModel::new(
            &config.model.endpoint,
            std::time::Duration::from_secs(config.model.timeout_secs),
        )?),
        ModelBackend::Pseudo => Arc::new(PseudoFaceModel::new(config.store.dimensions)),
    };
    Ok(model)
}

/// Detect, pick the largest face at or above `detection_threshold`, embed it
/// and normalize the result.
pub fn analyze(
    model: &dyn FaceModel,
    image: &DynamicImage,
    detection_threshold: f32,
    dimensions: usize,
) -> Result<FaceEmbedding, FaceError> {
    let faces = model.detect(image)?;
    let face = largest_face(faces, detection_threshold).ok_or(FaceError::NoFace)?;

    let embedding = model.embed(image, &face)?;
    if embedding.len() != dimensions {
        return Err(FaceError::Embedding(format!(
            "expected {dimensions} values, model returned {}",
            embedding.len()
        )));
    }
    let embedding =
        store::normalize(embedding).map_err(|e| FaceError::Embedding(e.to_string()))?;

    Ok(FaceEmbedding { face, embedding })
}

/// Largest face by area among those at or above the threshold.
pub fn largest_face(faces: Vec<DetectedFace>, detection_threshold: f32) -> Option<DetectedFace> {
    faces
        .into_iter()
        .filter(|face| face.det_score >= detection_threshold)
        .fold(None, |best: Option<DetectedFace>, face| match best {
            Some(best) if best.area() >= face.area() => Some(best),
            _ => Some(face),
        })
}

/// Decode raw bytes after sniffing that they are an image.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, FaceError> {
    match infer::get(bytes) {
        Some(kind) if kind.matcher_type() == infer::MatcherType::Image => {}
        Some(kind) => {
            return Err(FaceError::Decode(format!("not an image: {}", kind.mime_type())));
        }
        None => return Err(FaceError::Decode("unknown file type".to_string())),
    }

    image::load_from_memory(bytes).map_err(|e| FaceError::Decode(e.to_string()))
}

/// Mean of several embeddings, normalized. `None` when the input is empty or
/// the mean has zero norm.
pub fn average_embeddings(embeddings: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = embeddings.first()?;
    let mut sum = vec![0.0f32; first.len()];
    for embedding in embeddings {
        if embedding.len() != sum.len() {
            return None;
        }
        for (acc, value) in sum.iter_mut().zip(embedding) {
            *acc += value;
        }
    }
    let count = embeddings.len() as f32;
    sum.iter_mut().for_each(|value| *value /= count);
    store::normalize(sum).ok()
}
