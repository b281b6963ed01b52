//! rollcall-core: liveness and identification engine.
//!
//! Blink-based liveness over a dense face mesh, SCRFD face detection and an
//! embedding network via ONNX Runtime, and Euclidean gallery matching.

pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod imaging;
pub mod liveness;
pub mod matcher;
pub mod mesh;
pub mod onnx;
pub mod recognizer;
pub mod types;

pub use extractor::{ExtractError, FaceExtractor, LandmarkDetector};
pub use gallery::{GalleryError, GalleryStore, JsonGalleryStore, MemoryGalleryStore};
pub use liveness::{LivenessConfig, LivenessState, LivenessTracker, LivenessVerdict};
pub use matcher::{FaceMatcher, MatcherConfig, Recognition, RecognizeError, RegisterError};
pub use onnx::{OnnxFaceExtractor, OnnxLandmarker};
pub use recognizer::RecognizerConfig;
pub use types::{DetectedFace, Embedding, FaceBox, Faces, GalleryEntry, LandmarkSet};
