//! Threaded frame source with newest-frame-wins handoff.
//!
//! A dedicated capture thread pulls frames from the device as fast as the
//! device delivers them, mirrors each one, and publishes it into a single
//! shared slot. Consumers call [`FrameSource::latest`] at their own cadence
//! and never block on device I/O. Frames that nobody reads are dropped.

use crate::camera::{Camera, CameraError, CaptureDevice, FrameStream};
use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Consecutive failed reads before the stream is torn down and reopened.
const REOPEN_AFTER_FAILURES: u32 = 10;
/// Consecutive failed reads before `latest()` starts reporting nothing.
const UNAVAILABLE_AFTER_FAILURES: u32 = 100;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("device unavailable: {device}: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("cannot start capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Timing knobs for the capture loop.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Upper bound on opening the device.
    pub open_timeout: Duration,
    /// Sleep after a failed read before retrying.
    pub retry_backoff: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(3),
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// State shared between the capture thread and observers.
#[derive(Default)]
struct Shared {
    /// Most recent frame. The lock guards only the pointer swap.
    slot: Mutex<Option<Arc<Frame>>>,
    running: AtomicBool,
    available: AtomicBool,
    frames_captured: AtomicU64,
    failed_reads: AtomicU64,
}

/// Snapshot of capture statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub failed_reads: u64,
    pub available: bool,
}

/// Background capture loop exposing the most recent frame.
pub struct FrameSource {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    device_name: String,
}

impl FrameSource {
    /// Open `/dev/video{index}` and start capturing.
    pub fn open(index: u32, options: SourceOptions) -> Result<Self, SourceError> {
        Self::open_path(&format!("/dev/video{index}"), options)
    }

    /// Open a V4L2 device by path and start capturing.
    ///
    /// Opening runs on a helper thread so a wedged driver cannot stall the
    /// caller past `options.open_timeout`.
    pub fn open_path(device_path: &str, options: SourceOptions) -> Result<Self, SourceError> {
        let camera = open_bounded(device_path, options.open_timeout)?;
        Self::spawn(camera, options)
    }

    /// Start the capture loop on an already-open device.
    ///
    /// One synchronous capture is attempted first so `latest()` is usually
    /// populated by the time this returns. Its failure is not fatal.
    pub fn spawn<D: CaptureDevice>(device: D, options: SourceOptions) -> Result<Self, SourceError> {
        let device_name = device.name().to_string();
        let shared = Arc::new(Shared::default());
        shared.running.store(true, Ordering::Release);

        prime(&device, &shared);

        let thread_shared = Arc::clone(&shared);
        let backoff = options.retry_backoff;
        let thread = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || capture_loop(device, &thread_shared, backoff))
            .map_err(SourceError::Spawn)?;

        tracing::info!(device = %device_name, "frame source started");

        Ok(Self {
            shared,
            thread: Some(thread),
            device_name,
        })
    }

    /// The most recently captured frame, or `None` if nothing has been
    /// captured yet or the device has stopped delivering frames.
    ///
    /// Never blocks on the device. The returned frame is an independent
    /// handle; later captures do not alter it.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        if !self.shared.available.load(Ordering::Acquire) {
            return None;
        }
        self.shared.slot.lock().clone()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            failed_reads: self.shared.failed_reads.load(Ordering::Relaxed),
            available: self.shared.available.load(Ordering::Acquire),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop the capture loop and release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::Release);
        if thread.join().is_err() {
            tracing::error!(device = %self.device_name, "capture thread panicked");
        }
        self.shared.available.store(false, Ordering::Release);
        tracing::info!(device = %self.device_name, "frame source closed");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_bounded(device_path: &str, timeout: Duration) -> Result<Camera, SourceError> {
    let (tx, rx) = mpsc::channel();
    let path = device_path.to_string();
    std::thread::Builder::new()
        .name("rollcall-open".into())
        .spawn(move || {
            let _ = tx.send(Camera::open(&path));
        })
        .map_err(|e| SourceError::DeviceUnavailable {
            device: device_path.to_string(),
            reason: format!("failed to spawn open thread: {e}"),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(camera)) => Ok(camera),
        Ok(Err(e)) => Err(SourceError::DeviceUnavailable {
            device: device_path.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(SourceError::DeviceUnavailable {
            device: device_path.to_string(),
            reason: format!("open did not complete within {timeout:?}"),
        }),
    }
}

fn prime<D: CaptureDevice>(device: &D, shared: &Shared) {
    let result = device.stream().and_then(|mut s| s.next_frame());
    match result {
        Ok(frame) => publish(shared, frame),
        Err(e) => tracing::debug!(device = device.name(), error = %e, "priming capture failed"),
    }
}

fn publish(shared: &Shared, mut frame: Frame) {
    frame.mirror_horizontal();
    frame.sequence = shared.frames_captured.fetch_add(1, Ordering::Relaxed) + 1;
    let frame = Arc::new(frame);
    *shared.slot.lock() = Some(frame);
    shared.available.store(true, Ordering::Release);
}

/// Runs until `running` is cleared. The device is dropped when this returns.
fn capture_loop<D: CaptureDevice>(device: D, shared: &Shared, backoff: Duration) {
    let mut consecutive_failures = 0u32;

    while shared.running.load(Ordering::Acquire) {
        let mut stream = match device.stream() {
            Ok(stream) => stream,
            Err(e) => {
                note_failure(shared, &mut consecutive_failures, device.name(), &e);
                std::thread::sleep(backoff);
                continue;
            }
        };

        while shared.running.load(Ordering::Acquire) {
            match stream.next_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    publish(shared, frame);
                }
                Err(e) => {
                    note_failure(shared, &mut consecutive_failures, device.name(), &e);
                    std::thread::sleep(backoff);
                    if consecutive_failures % REOPEN_AFTER_FAILURES == 0 {
                        tracing::debug!(device = device.name(), "reopening capture stream");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(device = device.name(), "capture loop exiting, releasing device");
}

fn note_failure(shared: &Shared, consecutive: &mut u32, device: &str, err: &CameraError) {
    *consecutive = consecutive.saturating_add(1);
    shared.failed_reads.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(device, error = %err, consecutive = *consecutive, "capture failed");

    if *consecutive == UNAVAILABLE_AFTER_FAILURES {
        tracing::warn!(device, "capture failing persistently; marking source unavailable");
        shared.available.store(false, Ordering::Release);
    }
}
