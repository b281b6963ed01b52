//! Face embedding network via ONNX Runtime.
//!
//! Crops the detected face, resizes it to the network's square input and
//! returns the raw output vector. Defaults match a 128-d ResNet embedder
//! trained so that same-person pairs fall under a Euclidean distance of ~0.6.

use crate::imaging;
use crate::types::{Embedding, FaceBox};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Input geometry and normalisation for the embedding network.
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    pub input_size: u32,
    /// Per-channel RGB mean subtracted before scaling.
    pub mean: [f32; 3],
    pub scale: f32,
    /// Box growth factor around the detected face before cropping.
    pub crop_margin: f32,
    pub embedding_dim: usize,
    pub model_version: String,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: 150,
            mean: [122.782, 117.001, 104.298],
            scale: 1.0 / 256.0,
            crop_margin: 1.25,
            embedding_dim: 128,
            model_version: "resnet128_v1".to_string(),
        }
    }
}

/// Embedding extractor for one face crop.
pub struct FaceRecognizer {
    session: Session,
    config: RecognizerConfig,
}

impl FaceRecognizer {
    pub fn load(model_path: &str, config: RecognizerConfig) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input = config.input_size,
            dim = config.embedding_dim,
            version = %config.model_version,
            "loaded embedding model"
        );

        Ok(Self { session, config })
    }

    pub fn model_version(&self) -> &str {
        &self.config.model_version
    }

    /// Extract the embedding of `face` from a full RGB frame image.
    pub fn extract(&mut self, img: &RgbImage, face: &FaceBox) -> Result<Embedding, RecognizerError> {
        let region = face.expanded_square(self.config.crop_margin);
        let (crop, _) = imaging::crop_square(img, &region, self.config.input_size)
            .ok_or(RecognizerError::EmptyCrop)?;
        let input = preprocess(&crop, &self.config);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.config.embedding_dim {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.config.embedding_dim,
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(self.config.model_version.clone()),
        })
    }
}

/// Square RGB crop → normalised 1×3×S×S tensor.
fn preprocess(crop: &RgbImage, config: &RecognizerConfig) -> Array4<f32> {
    let size = config.input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel.0[c] as f32 - config.mean[c]) * config.scale;
        }
    }
    tensor
}
