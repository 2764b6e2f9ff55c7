use std::io::Cursor;
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use super::{DetectedFace, FaceError, FaceModel};

#[derive(Serialize)]
struct AnalyzeRequest {
    image_base64: String,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    faces: Vec<DetectedFace>,
}

/// Model service reached over HTTP.
///
/// `POST {endpoint}` with `{"image_base64": ...}` answers
/// `{"faces": [{"bbox": [x1, y1, x2, y2], "det_score": f, "embedding": [...]}]}`.
pub struct HttpFaceModel {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpFaceModel {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build model client")?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

impl FaceModel for HttpFaceModel {
    fn name(&self) -> &str {
        "http"
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, FaceError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| FaceError::Decode(e.to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&AnalyzeRequest {
                image_base64: STANDARD.encode(&png),
            })
            .send()
            .map_err(|e| FaceError::Detection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FaceError::Detection(format!(
                "model service answered {}",
                response.status()
            )));
        }

        let body: AnalyzeResponse = response
            .json()
            .map_err(|e| FaceError::Detection(format!("malformed model reply: {e}")))?;

        log::debug!("model service found {} faces", body.faces.len());
        Ok(body.faces)
    }

    fn embed(&self, _image: &DynamicImage, face: &DetectedFace) -> Result<Vec<f32>, FaceError> {
        face.embedding
            .clone()
            .ok_or_else(|| FaceError::Embedding("model service returned no embedding".to_string()))
    }
}
