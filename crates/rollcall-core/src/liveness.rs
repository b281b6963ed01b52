//! Blink-based liveness.
//!
//! Each frame's primary face yields an eye-aspect ratio (EAR) averaged over
//! both eyes. The tracker is a two-state machine with the threshold as the
//! hysteresis point: dropping below it closes the eye, returning to or above
//! it while closed reopens the eye and counts one blink. A subject is live
//! once a single blink has been counted, until the session is reset.
//!
//! Frames with no face or more than one face leave the state untouched.

use crate::extractor::{ExtractError, LandmarkDetector};
use crate::types::{Faces, LandmarkSet, Point};
use rollcall_hw::{Frame, Rgb};

/// Face-mesh indices of the left eye contour, ordered P0..P5.
pub const LEFT_EYE: [usize; 6] = [362, 385, 387, 263, 373, 380];
/// Face-mesh indices of the right eye contour, ordered P0..P5.
pub const RIGHT_EYE: [usize; 6] = [33, 160, 158, 133, 153, 144];
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.25;

const MARKER_COLOR: Rgb = [0, 255, 0];
const MARKER_RADIUS: u32 = 1;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub ear_threshold: f32,
    pub left_eye: [usize; 6],
    pub right_eye: [usize; 6],
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            left_eye: LEFT_EYE,
            right_eye: RIGHT_EYE,
        }
    }
}

fn dist(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// EAR = (‖P1−P5‖ + ‖P2−P4‖) / (2·‖P0−P3‖).
///
/// `None` if a landmark is missing or the eye has zero width.
pub fn eye_aspect_ratio(landmarks: &LandmarkSet, eye: &[usize; 6]) -> Option<f32> {
    let mut p = [(0.0, 0.0); 6];
    for (slot, &idx) in p.iter_mut().zip(eye.iter()) {
        *slot = landmarks.get(idx)?;
    }
    let width = dist(p[0], p[3]);
    if width <= f32::EPSILON {
        return None;
    }
    Some((dist(p[1], p[5]) + dist(p[2], p[4])) / (2.0 * width))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyeState {
    Open,
    Closed,
}

/// Blink state for one detection session.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessState {
    pub eye_closed: bool,
    pub blink_count: u32,
    pub ear_threshold: f32,
}

impl LivenessState {
    pub fn new(ear_threshold: f32) -> Self {
        Self {
            eye_closed: false,
            blink_count: 0,
            ear_threshold,
        }
    }

    /// Advance by one EAR sample. Returns `true` when this sample completes a blink.
    pub fn observe(&mut self, ear: f32) -> bool {
        if ear < self.ear_threshold {
            self.eye_closed = true;
            false
        } else if self.eye_closed {
            self.eye_closed = false;
            self.blink_count += 1;
            true
        } else {
            false
        }
    }

    pub fn eye_state(&self) -> EyeState {
        if self.eye_closed {
            EyeState::Closed
        } else {
            EyeState::Open
        }
    }

    pub fn is_live(&self) -> bool {
        self.blink_count > 0
    }
}

/// Per-frame output of [`LivenessTracker::process`].
pub struct LivenessVerdict {
    pub is_live: bool,
    /// Copy of the input frame with eye markers drawn on it.
    pub frame: Frame,
    pub blink_count: u32,
    /// Averaged EAR of the primary face, if one was measured this frame.
    pub ear: Option<f32>,
    pub faces_seen: usize,
}

pub struct LivenessTracker<D> {
    detector: D,
    config: LivenessConfig,
    state: LivenessState,
}

impl<D: LandmarkDetector> LivenessTracker<D> {
    pub fn new(detector: D, config: LivenessConfig) -> Self {
        let state = LivenessState::new(config.ear_threshold);
        Self {
            detector,
            config,
            state,
        }
    }

    pub fn process(&mut self, frame: &Frame) -> Result<LivenessVerdict, ExtractError> {
        let faces = Faces::from_vec(self.detector.landmarks(frame)?);
        let mut annotated = frame.clone();

        let ear = match &faces {
            Faces::Single(landmarks) => {
                let ear = self.average_ear(landmarks);
                if let Some(ear) = ear {
                    if self.state.observe(ear) {
                        tracing::debug!(blinks = self.state.blink_count, "blink detected");
                    }
                    tracing::trace!(ear, state = ?self.state.eye_state(), "eye aspect ratio");
                }
                self.draw_eye_markers(&mut annotated, landmarks);
                ear
            }
            Faces::None => None,
            Faces::Multiple { ignored, .. } => {
                tracing::debug!(ignored, "several faces in frame; liveness unchanged");
                None
            }
        };

        Ok(LivenessVerdict {
            is_live: self.state.is_live(),
            frame: annotated,
            blink_count: self.state.blink_count,
            ear,
            faces_seen: faces.count(),
        })
    }

    /// Start a new detection session.
    pub fn reset(&mut self) {
        self.state = LivenessState::new(self.config.ear_threshold);
    }

    pub fn state(&self) -> &LivenessState {
        &self.state
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    fn average_ear(&self, landmarks: &LandmarkSet) -> Option<f32> {
        let left = eye_aspect_ratio(landmarks, &self.config.left_eye)?;
        let right = eye_aspect_ratio(landmarks, &self.config.right_eye)?;
        Some((left + right) / 2.0)
    }

    fn draw_eye_markers(&self, frame: &mut Frame, landmarks: &LandmarkSet) {
        for &idx in self.config.left_eye.iter().chain(self.config.right_eye.iter()) {
            if let Some((x, y)) = landmarks.get(idx) {
                frame.draw_dot(x, y, MARKER_RADIUS, MARKER_COLOR);
            }
        }
    }
}
