//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture size; the driver may negotiate something else.
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    DeviceNotFound(String),
    #[error("capture error: {0}")]
    CaptureFailed(String),
    #[error("camera is in use by another process")]
    DeviceBusy,
    #[error("no usable pixel format: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot capture video")]
    StreamingNotSupported,
}

/// A capture-capable node found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB (3 bytes/pixel).
    Rgb24,
}

/// A device that can hand out a stream of RGB frames.
///
/// The stream borrows the device, so a capture loop opens one stream and
/// pulls from it until it fails, then reopens.
pub trait CaptureDevice: Send + 'static {
    type Stream<'a>: FrameStream
    where
        Self: 'a;

    fn stream(&self) -> Result<Self::Stream<'_>, CameraError>;

    /// Human-readable identifier used in logs.
    fn name(&self) -> &str;
}

/// A live sequence of frames from a [`CaptureDevice`].
pub trait FrameStream {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// An opened V4L2 capture device and its negotiated format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

const YUYV: FourCC = FourCC { repr: *b"YUYV" };
const RGB3: FourCC = FourCC { repr: *b"RGB3" };
const MAX_DEVICE_INDEX: u32 = 16;

fn is_capture(caps: &v4l::Capabilities) -> bool {
    caps.capabilities
        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
}

fn open_device(device_path: &str) -> Result<Device, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }
    Device::with_path(device_path).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("busy") || msg.contains("EBUSY") {
            CameraError::DeviceBusy
        } else {
            CameraError::DeviceNotFound(format!("{device_path}: {msg}"))
        }
    })
}

/// Request YUYV at the default size and map whatever the driver settles on.
fn negotiate(device: &Device) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
    wanted.fourcc = YUYV;
    wanted.width = REQUESTED_WIDTH;
    wanted.height = REQUESTED_HEIGHT;

    let got = device
        .set_format(&wanted)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;
    let pixel_format = match got.fourcc {
        f if f == YUYV => PixelFormat::Yuyv,
        f if f == RGB3 => PixelFormat::Rgb24,
        other => {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "driver offered {other:?}, need YUYV or RGB3"
            )))
        }
    };
    Ok((got, pixel_format))
}

impl Camera {
    /// Open `/dev/video{index}`.
    pub fn open_index(index: u32) -> Result<Self, CameraError> {
        Self::open(&format!("/dev/video{index}"))
    }

    /// Open a V4L2 capture device by path and negotiate an RGB-convertible format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let device = open_device(device_path)?;
        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !is_capture(&caps) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (format, pixel_format) = negotiate(&device)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = format.width,
            height = format.height,
            fourcc = ?format.fourcc,
            "camera ready"
        );

        Ok(Self {
            device,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        match self.pixel_format {
            PixelFormat::Rgb24 => {
                let expected = self.width as usize * self.height as usize * 3;
                buf.get(..expected).map(<[u8]>::to_vec).ok_or_else(|| {
                    CameraError::CaptureFailed(format!(
                        "short RGB3 buffer: {} of {expected} bytes",
                        buf.len()
                    ))
                })
            }
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion: {e}"))),
        }
    }

    /// Capture-capable devices among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                is_capture(&caps).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Memory-mapped capture stream borrowed from a [`Camera`].
pub struct CameraStream<'a> {
    camera: &'a Camera,
    inner: MmapStream<'a>,
}

impl CaptureDevice for Camera {
    type Stream<'a> = CameraStream<'a>;

    fn stream(&self) -> Result<CameraStream<'_>, CameraError> {
        let inner = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(CameraStream {
            camera: self,
            inner,
        })
    }

    fn name(&self) -> &str {
        &self.device_path
    }
}

impl FrameStream for CameraStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .inner
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;

        let rgb = self.camera.buf_to_rgb(buf)?;
        tracing::trace!(seq = meta.sequence, bytes = rgb.len(), "dequeued frame");

        Ok(Frame {
            data: rgb,
            width: self.camera.width,
            height: self.camera.height,
            timestamp: std::time::Instant::now(),
            sequence: u64::from(meta.sequence),
        })
    }
}
