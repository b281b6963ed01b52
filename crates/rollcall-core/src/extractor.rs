//! Seams to the face models.
//!
//! The matcher and liveness tracker only see these traits. ONNX-backed
//! implementations live in [`crate::onnx`]; tests supply fakes.

use crate::types::{DetectedFace, LandmarkSet};
use rollcall_hw::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] crate::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] crate::recognizer::RecognizerError),
    #[error("landmark error: {0}")]
    Mesh(#[from] crate::mesh::MeshError),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Image → one `(box, embedding)` per face, most confident face first.
pub trait FaceExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, ExtractError>;
}

/// Image → one dense landmark set per face, most confident face first.
pub trait LandmarkDetector {
    fn landmarks(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>, ExtractError>;
}
