//! 468-point face mesh landmarker via ONNX Runtime.
//!
//! Runs on a square crop around each detected face and maps the predicted
//! points back into frame coordinates. Eye contours used for the
//! eye-aspect ratio come from this mesh.

use crate::imaging::{self, CropInfo};
use crate::types::{FaceBox, LandmarkSet};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const MESH_POINTS: usize = 468;
const MESH_INPUT_SIZE: u32 = 192;
/// The mesh model expects some forehead and chin around the detector box.
const MESH_CROP_MARGIN: f32 = 1.5;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceMesh {
    session: Session,
}

impl FaceMesh {
    pub fn load(model_path: &str) -> Result<Self, MeshError> {
        if !Path::new(model_path).exists() {
            return Err(MeshError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded face mesh model");
        Ok(Self { session })
    }

    /// Predict the dense landmark set for one detected face.
    pub fn landmarks(&mut self, img: &RgbImage, face: &FaceBox) -> Result<LandmarkSet, MeshError> {
        let region = face.expanded_square(MESH_CROP_MARGIN);
        let (crop, info) =
            imaging::crop_square(img, &region, MESH_INPUT_SIZE).ok_or(MeshError::EmptyCrop)?;
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| MeshError::InferenceFailed(format!("landmark extraction: {e}")))?;

        decode(raw, &info)
    }
}

/// RGB crop → 1×3×192×192 tensor scaled to [0, 1].
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = MESH_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel.0[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Raw `[x, y, z] × 468` in crop pixels → frame-space landmark set.
fn decode(raw: &[f32], info: &CropInfo) -> Result<LandmarkSet, MeshError> {
    if raw.len() < MESH_POINTS * 3 {
        return Err(MeshError::InferenceFailed(format!(
            "expected {} landmark values, got {}",
            MESH_POINTS * 3,
            raw.len()
        )));
    }
    let points = raw
        .chunks_exact(3)
        .take(MESH_POINTS)
        .map(|p| info.to_frame(p[0], p[1]))
        .collect();
    Ok(LandmarkSet { points })
}
