//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the RGB frame to 640×640, runs the three-stride anchor-free
//! head and keeps the boxes that survive NMS, most confident first.

use crate::imaging;
use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_hw::Frame;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer does not match its dimensions")]
    BadFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn for_frame(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }

        let stride_outputs = output_layout(&names);
        tracing::info!(path = model_path, outputs = ?names, ?stride_outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Detect faces in an RGB frame, most confident first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
        let letterbox = Letterbox::for_frame(frame.width, frame.height);
        let input = preprocess(frame, &letterbox)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(count = faces.len(), "SCRFD detections");
        Ok(faces)
    }
}

/// Letterbox `frame` into a normalised 1×3×640×640 RGB tensor.
fn preprocess(frame: &Frame, letterbox: &Letterbox) -> Result<Array4<f32>, DetectorError> {
    let img = imaging::to_rgb_image(frame).ok_or(DetectorError::BadFrame)?;
    let new_w = ((frame.width as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((frame.height as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(&img, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding left at zero equals SCRFD_MEAN after normalisation.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (px, py) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + px, y as usize + py);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    Ok(tensor)
}

/// Map output tensors to strides by name (`score_8`, `bbox_16`, …), falling
/// back to the standard positional export order.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut layout = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (slot, &stride) in layout.iter_mut().zip(SCRFD_STRIDES.iter()) {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => *slot = (s, b, k),
            _ => {
                tracing::debug!(stride, "SCRFD outputs unnamed, using positional layout");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    layout
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<FaceBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        out.push(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    out
}

/// Greedy non-maximum suppression. Output is sorted by confidence, descending.
fn nms(mut faces: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| iou(k, &face) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

/// Intersection-over-union of two boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
