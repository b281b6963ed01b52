use crate::config::Config;
use crate::pipeline::{AutoOutcome, FrameOutcome, Modes, Pipeline, PipelineError};
use crate::session::SessionStatus;
use rollcall_core::{
    ExtractError, FaceExtractor, FaceMatcher, GalleryError, GalleryStore, JsonGalleryStore,
    LandmarkDetector, LivenessTracker, OnnxFaceExtractor, OnnxLandmarker, RecognizerConfig,
};
use rollcall_hw::{Frame, FrameSource, SourceError};
use rollcall_ledger::{Action, Clock, Confirmation, Ledger, LedgerError, Subject};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("model load failed: {0}")]
    Models(#[from] ExtractError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Daemon status, serialized as JSON for `Status()`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub camera_device: String,
    pub camera_available: bool,
    pub frames_captured: u64,
    pub failed_reads: u64,
    pub frames_processed: u64,
    pub gallery_size: usize,
    pub modes: Modes,
    pub session: SessionStatus,
    /// Overlay labels of the most recently processed frame.
    pub overlays: Vec<String>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Punch {
        action: Action,
        reply: oneshot::Sender<Result<Confirmation, EngineError>>,
    },
    PunchSubject {
        subject_id: i64,
        action: Action,
        reply: oneshot::Sender<Result<Confirmation, EngineError>>,
    },
    Register {
        name: String,
        reply: oneshot::Sender<Result<Subject, EngineError>>,
    },
    ResetSession {
        reply: oneshot::Sender<()>,
    },
    SetModes {
        modes: Modes,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<Frame>>,
    },
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Punch the subject currently recognized in front of the camera.
    pub async fn punch(&self, action: Action) -> Result<Confirmation, EngineError> {
        self.call(|reply| EngineRequest::Punch { action, reply }).await?
    }

    pub async fn punch_subject(
        &self,
        subject_id: i64,
        action: Action,
    ) -> Result<Confirmation, EngineError> {
        self.call(|reply| EngineRequest::PunchSubject {
            subject_id,
            action,
            reply,
        })
        .await?
    }

    /// Enroll whoever is in the latest frame under `name`.
    pub async fn register(&self, name: &str) -> Result<Subject, EngineError> {
        let name = name.to_string();
        self.call(|reply| EngineRequest::Register { name, reply }).await?
    }

    pub async fn reset_session(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::ResetSession { reply }).await
    }

    pub async fn set_modes(&self, modes: Modes) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::SetModes { modes, reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }

    /// The most recently processed frame with eye markers drawn on it.
    pub async fn snapshot(&self) -> Result<Option<Frame>, EngineError> {
        self.call(|reply| EngineRequest::Snapshot { reply }).await
    }

    /// Stop the engine and wait until it has released the camera.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineRequest::Shutdown).await;
        self.tx.closed().await;
    }
}

/// Open the camera, load the models, gallery and ledger, then start the
/// engine thread. Fails fast if any of them is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let source = FrameSource::open_path(&config.camera_device, config.source_options())?;
    tracing::info!(device = %config.camera_device, "camera opened");

    let detector_path = config.detector_model_path();
    let landmarker = OnnxLandmarker::load(&detector_path, &config.mesh_model_path())?;
    let extractor = OnnxFaceExtractor::load(
        &detector_path,
        &config.embedder_model_path(),
        RecognizerConfig::default(),
    )?;
    tracing::info!(dir = %config.model_dir.display(), "models loaded");

    let matcher = FaceMatcher::load(
        extractor,
        JsonGalleryStore::new(&config.gallery_path),
        config.matcher_config(),
    )?;
    let ledger = Ledger::open(&config.db_path, config.ledger_config())?;

    let pipeline = Pipeline::new(
        LivenessTracker::new(landmarker, config.liveness_config()),
        matcher,
        ledger,
        config.punch_policy(),
        Modes {
            auto: config.auto_mode,
            manual: config.manual_mode,
        },
    );
    spawn(pipeline, source, config.frame_interval())
}

/// Run `pipeline` over frames from `source` on a dedicated OS thread.
pub fn spawn<L, E, S, C>(
    pipeline: Pipeline<L, E, S, C>,
    source: FrameSource,
    interval: Duration,
) -> Result<EngineHandle, EngineError>
where
    L: LandmarkDetector + Send + 'static,
    E: FaceExtractor + Send + 'static,
    S: GalleryStore + Send + 'static,
    C: Clock + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let engine = Engine {
        pipeline,
        source,
        interval,
        last_sequence: None,
        frames_processed: 0,
        camera_available: true,
        overlays: Vec::new(),
        annotated: None,
        step_errors: ErrorStreak::default(),
    };
    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || engine.run(rx))
        .map_err(EngineError::Spawn)?;
    Ok(EngineHandle { tx })
}

struct Engine<L, E, S, C> {
    pipeline: Pipeline<L, E, S, C>,
    source: FrameSource,
    interval: Duration,
    last_sequence: Option<u64>,
    frames_processed: u64,
    camera_available: bool,
    overlays: Vec<String>,
    annotated: Option<Frame>,
    step_errors: ErrorStreak,
}

/// Tracks the kind of the last per-frame failure so a fault that repeats
/// on every frame is reported once, not once per frame.
#[derive(Debug, Default)]
struct ErrorStreak {
    current: Option<&'static str>,
}

impl ErrorStreak {
    /// Record a failure; true when it starts a new streak.
    fn fail(&mut self, kind: &'static str) -> bool {
        let fresh = self.current != Some(kind);
        self.current = Some(kind);
        fresh
    }

    /// Record a success; true when it ends a streak.
    fn clear(&mut self) -> bool {
        self.current.take().is_some()
    }
}

impl<L, E, S, C> Engine<L, E, S, C>
where
    L: LandmarkDetector,
    E: FaceExtractor,
    S: GalleryStore,
    C: Clock,
{
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!("engine thread started");
        'outer: loop {
            loop {
                match rx.try_recv() {
                    Ok(EngineRequest::Shutdown) | Err(TryRecvError::Disconnected) => break 'outer,
                    Ok(req) => self.handle(req),
                    Err(TryRecvError::Empty) => break,
                }
            }
            self.tick();
            std::thread::sleep(self.interval);
        }
        self.source.close();
        tracing::info!("engine thread exiting");
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Punch { action, reply } => {
                let result = self.pipeline.punch(action).map_err(EngineError::from);
                log_punch(&result, action);
                let _ = reply.send(result);
            }
            EngineRequest::PunchSubject {
                subject_id,
                action,
                reply,
            } => {
                let result = self
                    .pipeline
                    .punch_subject(subject_id, action)
                    .map_err(EngineError::from);
                log_punch(&result, action);
                let _ = reply.send(result);
            }
            EngineRequest::Register { name, reply } => {
                let result = match self.source.latest() {
                    Some(frame) => self.pipeline.register(&frame, &name),
                    None => Err(PipelineError::NoFrame),
                };
                if let Err(e) = &result {
                    tracing::warn!(name, error = %e, "registration refused");
                }
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::ResetSession { reply } => {
                self.pipeline.reset_session();
                let _ = reply.send(());
            }
            EngineRequest::SetModes { modes, reply } => {
                tracing::info!(auto = modes.auto, manual = modes.manual, "modes changed");
                self.pipeline.set_modes(modes);
                let _ = reply.send(());
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::Snapshot { reply } => {
                let _ = reply.send(self.annotated.clone());
            }
            EngineRequest::Shutdown => {}
        }
    }

    /// Process the newest frame if it has not been seen yet.
    fn tick(&mut self) {
        let Some(frame) = self.source.latest() else {
            if self.camera_available && !self.source.stats().available && self.last_sequence.is_some() {
                tracing::warn!(device = %self.source.device_name(), "camera stopped delivering frames");
                self.camera_available = false;
            }
            return;
        };
        if !self.camera_available {
            tracing::info!(device = %self.source.device_name(), "camera delivering frames again");
            self.camera_available = true;
        }
        if self.last_sequence == Some(frame.sequence) {
            return;
        }
        self.last_sequence = Some(frame.sequence);
        self.frames_processed += 1;

        match self.pipeline.step(&frame) {
            Ok(outcome) => {
                if self.step_errors.clear() {
                    tracing::info!(sequence = frame.sequence, "frame processing recovered");
                }
                self.observe(outcome);
            }
            Err(e) if self.step_errors.fail(e.kind()) => {
                tracing::warn!(error = %e, kind = e.kind(), sequence = frame.sequence, "frame processing failing");
            }
            Err(e) => tracing::debug!(error = %e, sequence = frame.sequence, "frame skipped"),
        }
    }

    fn observe(&mut self, outcome: FrameOutcome) {
        self.overlays = outcome.overlays.iter().map(|o| o.label()).collect();
        self.annotated = Some(outcome.frame);
        if let Some(recognition) = &outcome.recognition {
            tracing::trace!(live = outcome.live, identity = ?recognition.as_pair().0, "frame processed");
        }
        match outcome.auto {
            Some(AutoOutcome::Recorded(c)) => tracing::info!(message = %c.message, "auto punch"),
            Some(AutoOutcome::Rejected {
                action,
                error: LedgerError::CooldownActive { remaining, .. },
            }) => {
                tracing::warn!(%action, remaining_secs = remaining.as_secs(), "auto punch in cooldown")
            }
            Some(AutoOutcome::Rejected { .. }) | Some(AutoOutcome::AlreadyLogged { .. }) | None => {}
        }
    }

    fn status(&self) -> EngineStatus {
        let stats = self.source.stats();
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            camera_device: self.source.device_name().to_string(),
            camera_available: stats.available,
            frames_captured: stats.frames_captured,
            failed_reads: stats.failed_reads,
            frames_processed: self.frames_processed,
            gallery_size: self.pipeline.gallery_len(),
            modes: self.pipeline.modes(),
            session: self.pipeline.status(),
            overlays: self.overlays.clone(),
        }
    }
}

fn log_punch(result: &Result<Confirmation, EngineError>, action: Action) {
    match result {
        Ok(c) => tracing::info!(message = %c.message, "manual punch"),
        Err(e) => tracing::warn!(%action, error = %e, "manual punch refused"),
    }
}
