//! rollcall-hw: hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access and a background frame source that
//! always exposes the newest mirrored frame without blocking.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CaptureDevice, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError, Rgb};
pub use source::{FrameSource, SourceError, SourceOptions, SourceStats};
