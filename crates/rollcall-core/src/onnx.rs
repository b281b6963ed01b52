//! ONNX-backed implementations of the extractor traits.

use crate::detector::FaceDetector;
use crate::extractor::{ExtractError, FaceExtractor, LandmarkDetector};
use crate::imaging;
use crate::mesh::FaceMesh;
use crate::recognizer::{FaceRecognizer, RecognizerConfig};
use crate::types::{DetectedFace, LandmarkSet};
use rollcall_hw::Frame;

fn frame_image(frame: &Frame) -> Result<image::RgbImage, ExtractError> {
    imaging::to_rgb_image(frame).ok_or_else(|| {
        ExtractError::InvalidFrame(format!(
            "{} bytes for {}x{} RGB",
            frame.data.len(),
            frame.width,
            frame.height
        ))
    })
}

/// SCRFD detection followed by the embedding network on every face.
pub struct OnnxFaceExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceExtractor {
    pub fn load(
        detector_path: &str,
        embedder_path: &str,
        config: RecognizerConfig,
    ) -> Result<Self, ExtractError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            recognizer: FaceRecognizer::load(embedder_path, config)?,
        })
    }
}

impl FaceExtractor for OnnxFaceExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, ExtractError> {
        let img = frame_image(frame)?;
        let boxes = self.detector.detect(frame)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.recognizer.extract(&img, &bbox)?;
            faces.push(DetectedFace { bbox, embedding });
        }
        Ok(faces)
    }
}

/// SCRFD detection followed by the face mesh on every face.
pub struct OnnxLandmarker {
    detector: FaceDetector,
    mesh: FaceMesh,
}

impl OnnxLandmarker {
    pub fn load(detector_path: &str, mesh_path: &str) -> Result<Self, ExtractError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            mesh: FaceMesh::load(mesh_path)?,
        })
    }
}

impl LandmarkDetector for OnnxLandmarker {
    fn landmarks(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>, ExtractError> {
        let img = frame_image(frame)?;
        let boxes = self.detector.detect(frame)?;
        boxes
            .iter()
            .map(|bbox| self.mesh.landmarks(&img, bbox).map_err(ExtractError::from))
            .collect()
    }
}
