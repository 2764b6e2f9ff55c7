use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::{DetectedFace, FaceError, FaceModel};

/// Deterministic stand-in model. Treats the whole image as one face and
/// derives the embedding from a hash of its pixels, so identical images map to
/// identical vectors and anything else to an unrelated one.
///
/// Not a recognizer. Refused when serving in production mode.
pub struct PseudoFaceModel {
    dimensions: usize,
}

impl PseudoFaceModel {
    pub fn new(dimensions: usize) -> Self {
        log::warn!("using pseudo face model: embeddings are pixel hashes, not face features");
        Self { dimensions }
    }
}

impl FaceModel for PseudoFaceModel {
    fn name(&self) -> &str {
        "pseudo"
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, FaceError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        Ok(vec![DetectedFace {
            bbox: [0.0, 0.0, image.width() as f32, image.height() as f32],
            det_score: 1.0,
            embedding: None,
        }])
    }

    fn embed(&self, image: &DynamicImage, face: &DetectedFace) -> Result<Vec<f32>, FaceError> {
        let mut hasher = Sha256::new();
        hasher.update(image.to_rgb8().as_raw());
        for value in face.bbox {
            hasher.update(value.to_le_bytes());
        }
        let seed: [u8; 32] = hasher.finalize().into();

        let mut rng = StdRng::from_seed(seed);
        Ok((0..self.dimensions)
            .map(|_| rng.random_range(-1.0f32..1.0))
            .collect())
    }
}
