//! Model stand-ins driven by frame contents.
//!
//! A test scene is a uniformly filled frame, so mirroring does not change
//! it. The red channel carries the eye aspect ratio in hundredths (0 means
//! no face, 255 means two faces). Green and blue carry the identity: the
//! embedding is `[g, b] / 100`, and black means no face.

use rollcall_core::{DetectedFace, Embedding, ExtractError, FaceBox, FaceExtractor, LandmarkDetector, LandmarkSet};
use rollcall_hw::Frame;

pub const OPEN: u8 = 30;
pub const CLOSED: u8 = 10;
pub const TWO_FACES: u8 = 255;
pub const ALICE: [u8; 2] = [100, 0];
pub const BOB: [u8; 2] = [0, 100];
pub const NOBODY: [u8; 2] = [0, 0];

pub fn scene(eyes: u8, face: [u8; 2]) -> Frame {
    Frame::filled(4, 2, [eyes, face[0], face[1]])
}

pub fn eye_landmarks(ear: f32) -> LandmarkSet {
    let mut points = vec![(0.0, 0.0); 468];
    let h = ear / 2.0;
    for (x0, eye) in [(0.0, rollcall_core::liveness::LEFT_EYE), (2.0, rollcall_core::liveness::RIGHT_EYE)] {
        let p = [
            (x0, 0.5),
            (x0 + 0.3, 0.5 - h),
            (x0 + 0.7, 0.5 - h),
            (x0 + 1.0, 0.5),
            (x0 + 0.7, 0.5 + h),
            (x0 + 0.3, 0.5 + h),
        ];
        for (&idx, point) in eye.iter().zip(p) {
            points[idx] = point;
        }
    }
    LandmarkSet { points }
}

pub struct SceneMesh;

impl LandmarkDetector for SceneMesh {
    fn landmarks(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>, ExtractError> {
        let [code, _, _] = frame.pixel(0, 0).unwrap_or([0; 3]);
        Ok(match code {
            0 => vec![],
            TWO_FACES => vec![eye_landmarks(0.3), eye_landmarks(0.3)],
            c => vec![eye_landmarks(c as f32 / 100.0)],
        })
    }
}

pub struct SceneFaces;

impl FaceExtractor for SceneFaces {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, ExtractError> {
        let [_, g, b] = frame.pixel(0, 0).unwrap_or([0; 3]);
        if g == 0 && b == 0 {
            return Ok(vec![]);
        }
        Ok(vec![DetectedFace {
            bbox: FaceBox {
                x: 0.0,
                y: 0.0,
                width: frame.width as f32,
                height: frame.height as f32,
                confidence: 0.9,
                landmarks: None,
            },
            embedding: Embedding::new(vec![g as f32 / 100.0, b as f32 / 100.0]),
        }])
    }
}
