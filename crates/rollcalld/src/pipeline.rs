//! Per-frame attendance pipeline.
//!
//! liveness → recognition → (auto mode) ledger. Each stage short-circuits
//! the rest: a subject who has not blinked is never identified, and an
//! unidentified face is never recorded.

use crate::session::{Session, SessionStatus};
use chrono::{DateTime, Local, Timelike, Utc};
use rollcall_core::{
    ExtractError, FaceExtractor, FaceMatcher, GalleryStore, LandmarkDetector, LivenessTracker,
    Recognition, RecognizeError, RegisterError,
};
use rollcall_hw::{Frame, Rgb};
use rollcall_ledger::{Action, Clock, Confirmation, Ledger, LedgerError, Subject};
use serde::Serialize;
use thiserror::Error;

/// Matches at or below this confidence are shown as unknown.
pub const MIN_CONFIDENCE: f32 = 0.5;

/// Which action an automatic punch records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchPolicy {
    /// Local hour from which punches are PUNCH_OUT.
    pub boundary_hour: u32,
}

impl Default for PunchPolicy {
    fn default() -> Self {
        Self { boundary_hour: 14 }
    }
}

impl PunchPolicy {
    pub fn action_at(&self, hour: u32) -> Action {
        if hour < self.boundary_hour {
            Action::PunchIn
        } else {
            Action::PunchOut
        }
    }

    pub fn action_for(&self, at: DateTime<Utc>) -> Action {
        self.action_at(at.with_timezone(&Local).hour())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Modes {
    /// Record on recognition.
    pub auto: bool,
    /// Accept operator punch requests.
    pub manual: bool,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            auto: true,
            manual: true,
        }
    }
}

/// Status drawn over the outgoing frame. Rendering text is the viewer's job.
#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    BlinkPrompt,
    Identity { name: String, confidence: f32 },
    LastAction(Action),
    UnknownUser,
}

impl Overlay {
    pub fn label(&self) -> String {
        match self {
            Overlay::BlinkPrompt => "PLEASE BLINK TO VERIFY".to_string(),
            Overlay::Identity { name, confidence } => {
                format!("{name} ({}%)", (confidence * 100.0) as u32)
            }
            Overlay::LastAction(action) => format!("Last: {action}"),
            Overlay::UnknownUser => "Unknown User".to_string(),
        }
    }

    pub fn color(&self) -> Rgb {
        match self {
            Overlay::BlinkPrompt => [0, 255, 255],
            Overlay::Identity { .. } | Overlay::LastAction(_) => [0, 255, 0],
            Overlay::UnknownUser => [255, 0, 0],
        }
    }
}

/// What auto mode did with a recognized subject.
#[derive(Debug)]
pub enum AutoOutcome {
    Recorded(Confirmation),
    /// This session already punched `action` for the subject; the ledger
    /// was not consulted.
    AlreadyLogged { action: Action },
    Rejected { action: Action, error: LedgerError },
}

pub struct FrameOutcome {
    /// Input frame with eye markers drawn on it.
    pub frame: Frame,
    pub overlays: Vec<Overlay>,
    pub live: bool,
    /// `None` until the subject has proven liveness.
    pub recognition: Option<Recognition>,
    pub auto: Option<AutoOutcome>,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("liveness check failed: {0}")]
    Liveness(#[from] ExtractError),
    #[error("recognition failed: {0}")]
    Recognize(#[from] RecognizeError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("No user recognized. Please look at the camera and blink.")]
    NoSubjectRecognized,
    #[error("manual mode is disabled")]
    ManualDisabled,
    #[error("no frame captured yet")]
    NoFrame,
}

impl PipelineError {
    /// Coarse category, stable across repeats of the same underlying fault.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Liveness(_) => "liveness",
            PipelineError::Recognize(RecognizeError::Extract(_)) => "recognition",
            PipelineError::Recognize(RecognizeError::Incompatible(_)) => "incompatible-gallery",
            PipelineError::Register(_) => "register",
            PipelineError::Ledger(_) => "ledger",
            PipelineError::NoSubjectRecognized => "no-subject",
            PipelineError::ManualDisabled => "manual-disabled",
            PipelineError::NoFrame => "no-frame",
        }
    }
}

pub struct Pipeline<L, E, S, C> {
    liveness: LivenessTracker<L>,
    matcher: FaceMatcher<E, S>,
    ledger: Ledger<C>,
    policy: PunchPolicy,
    modes: Modes,
    session: Session,
}

impl<L, E, S, C> Pipeline<L, E, S, C>
where
    L: LandmarkDetector,
    E: FaceExtractor,
    S: GalleryStore,
    C: Clock,
{
    pub fn new(
        liveness: LivenessTracker<L>,
        matcher: FaceMatcher<E, S>,
        ledger: Ledger<C>,
        policy: PunchPolicy,
        modes: Modes,
    ) -> Self {
        Self {
            liveness,
            matcher,
            ledger,
            policy,
            modes,
            session: Session::default(),
        }
    }

    pub fn step(&mut self, frame: &Frame) -> Result<FrameOutcome, PipelineError> {
        let verdict = self.liveness.process(frame)?;
        let mut outcome = FrameOutcome {
            frame: verdict.frame,
            overlays: Vec::new(),
            live: verdict.is_live,
            recognition: None,
            auto: None,
        };
        if !verdict.is_live {
            outcome.overlays.push(Overlay::BlinkPrompt);
            return Ok(outcome);
        }

        // Markers on the annotated copy would perturb the embedding.
        let recognition = self.matcher.recognize(frame)?;
        match &recognition {
            Recognition::Match { name, confidence } if *confidence > MIN_CONFIDENCE => {
                self.session.set_current(name, *confidence);
                outcome.overlays.push(Overlay::Identity {
                    name: name.clone(),
                    confidence: *confidence,
                });
                if let Some(last) = self.session.last_action(name) {
                    outcome.overlays.push(Overlay::LastAction(last));
                }
                if self.modes.auto {
                    outcome.auto = Some(self.auto_punch(name));
                }
            }
            _ => {
                self.session.clear_current();
                outcome.overlays.push(Overlay::UnknownUser);
            }
        }
        outcome.recognition = Some(recognition);
        Ok(outcome)
    }

    fn auto_punch(&mut self, name: &str) -> AutoOutcome {
        let action = self.policy.action_for(self.ledger.clock().now());
        if self.session.already_logged(name, action) {
            return AutoOutcome::AlreadyLogged { action };
        }

        let result = self
            .ledger
            .ensure_subject(name)
            .and_then(|subject| self.ledger.record(subject.id, action));
        match result {
            Ok(confirmation) => {
                self.session.mark_logged(name, action);
                tracing::info!(name, %action, "auto punch recorded");
                AutoOutcome::Recorded(confirmation)
            }
            Err(error @ LedgerError::CooldownActive { .. }) => {
                // The ledger already holds this punch; stop resubmitting it.
                self.session.mark_logged(name, action);
                AutoOutcome::Rejected { action, error }
            }
            Err(error) => {
                tracing::warn!(name, %action, error = %error, "auto punch failed");
                AutoOutcome::Rejected { action, error }
            }
        }
    }

    /// Enroll the face in `frame` and create its ledger subject.
    pub fn register(&mut self, frame: &Frame, name: &str) -> Result<Subject, PipelineError> {
        self.matcher.register(frame, name)?;
        let subject = self.ledger.add_subject(name.trim())?;
        Ok(subject)
    }

    /// Manual trigger for the subject currently in front of the camera.
    pub fn punch(&mut self, action: Action) -> Result<Confirmation, PipelineError> {
        if !self.modes.manual {
            return Err(PipelineError::ManualDisabled);
        }
        let name = self
            .session
            .current()
            .map(|c| c.name.clone())
            .ok_or(PipelineError::NoSubjectRecognized)?;
        let subject = self.ledger.ensure_subject(&name)?;
        let confirmation = self.ledger.record(subject.id, action)?;
        self.session.mark_logged(&name, action);
        Ok(confirmation)
    }

    /// Manual trigger for an explicit subject.
    pub fn punch_subject(
        &mut self,
        subject_id: i64,
        action: Action,
    ) -> Result<Confirmation, PipelineError> {
        if !self.modes.manual {
            return Err(PipelineError::ManualDisabled);
        }
        let confirmation = self.ledger.record(subject_id, action)?;
        if let Some(subject) = self.ledger.subject(subject_id)? {
            self.session.mark_logged(&subject.name, action);
        }
        Ok(confirmation)
    }

    /// Forget the session and require a fresh blink.
    pub fn reset_session(&mut self) {
        self.session.reset();
        self.liveness.reset();
        tracing::info!("session reset");
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.liveness.state();
        self.session.status(state.is_live(), state.blink_count)
    }

    pub fn modes(&self) -> Modes {
        self.modes
    }

    pub fn set_modes(&mut self, modes: Modes) {
        self.modes = modes;
    }

    pub fn gallery_len(&self) -> usize {
        self.matcher.gallery().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::*;
    use chrono::TimeZone;
    use rollcall_core::{LivenessConfig, MatcherConfig, MemoryGalleryStore};
    use rollcall_ledger::{LedgerConfig, ManualClock};

    type TestPipeline = Pipeline<SceneMesh, SceneFaces, MemoryGalleryStore, ManualClock>;

    fn local(hour: u32, min: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2026, 3, 2, hour, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn pipeline(dir: &tempfile::TempDir) -> (TestPipeline, ManualClock) {
        let clock = ManualClock::new(local(9, 0));
        let ledger = Ledger::open_with_clock(
            dir.path().join("attendance.db"),
            LedgerConfig::default(),
            clock.clone(),
        )
        .unwrap();
        let matcher =
            FaceMatcher::load(SceneFaces, MemoryGalleryStore::default(), MatcherConfig::default())
                .unwrap();
        let p = Pipeline::new(
            LivenessTracker::new(SceneMesh, LivenessConfig::default()),
            matcher,
            ledger,
            PunchPolicy::default(),
            Modes::default(),
        );
        (p, clock)
    }

    fn blink(p: &mut TestPipeline, face: [u8; 2]) {
        p.step(&scene(CLOSED, face)).unwrap();
        p.step(&scene(OPEN, face)).unwrap();
    }

    #[test]
    fn test_punch_policy_boundary() {
        let policy = PunchPolicy::default();
        assert_eq!(policy.action_at(0), Action::PunchIn);
        assert_eq!(policy.action_at(13), Action::PunchIn);
        assert_eq!(policy.action_at(14), Action::PunchOut);
        assert_eq!(policy.action_at(23), Action::PunchOut);
        assert_eq!(policy.action_for(local(13, 59)), Action::PunchIn);
        assert_eq!(policy.action_for(local(14, 0)), Action::PunchOut);
    }

    #[test]
    fn test_overlay_labels() {
        let who = Overlay::Identity { name: "alice".into(), confidence: 0.876 };
        assert_eq!(who.label(), "alice (87%)");
        assert_eq!(Overlay::LastAction(Action::PunchIn).label(), "Last: PUNCH_IN");
        assert_eq!(Overlay::BlinkPrompt.label(), "PLEASE BLINK TO VERIFY");
        assert_eq!(Overlay::UnknownUser.label(), "Unknown User");
    }

    #[test]
    fn test_not_live_prompts_for_blink_and_skips_recognition() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        p.register(&scene(OPEN, ALICE), "alice").unwrap();

        let out = p.step(&scene(OPEN, ALICE)).unwrap();
        assert!(!out.live);
        assert_eq!(out.overlays, vec![Overlay::BlinkPrompt]);
        assert!(out.recognition.is_none());
        assert!(out.auto.is_none());
    }

    #[test]
    fn test_blink_then_auto_punch_in_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        let alice = p.register(&scene(OPEN, ALICE), "alice").unwrap();

        p.step(&scene(CLOSED, ALICE)).unwrap();
        let out = p.step(&scene(OPEN, ALICE)).unwrap();
        assert!(out.live);
        assert_eq!(out.recognition.as_ref().and_then(|r| r.name()), Some("alice"));
        match out.auto {
            Some(AutoOutcome::Recorded(c)) => {
                assert_eq!(c.event.subject_id, alice.id);
                assert_eq!(c.event.action, Action::PunchIn);
            }
            other => panic!("expected a recorded punch, got {other:?}"),
        }

        let again = p.step(&scene(OPEN, ALICE)).unwrap();
        assert!(matches!(again.auto, Some(AutoOutcome::AlreadyLogged { action: Action::PunchIn })));
        assert!(again.overlays.contains(&Overlay::LastAction(Action::PunchIn)));
    }

    #[test]
    fn test_afternoon_auto_punch_out_after_morning_in() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, clock) = pipeline(&dir);
        p.register(&scene(OPEN, ALICE), "alice").unwrap();
        blink(&mut p, ALICE);

        clock.set(local(14, 0));
        let out = p.step(&scene(OPEN, ALICE)).unwrap();
        assert!(matches!(
            out.auto,
            Some(AutoOutcome::Recorded(ref c)) if c.event.action == Action::PunchOut
        ));
    }

    #[test]
    fn test_unknown_face_clears_current_user() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        p.register(&scene(OPEN, ALICE), "alice").unwrap();
        blink(&mut p, ALICE);
        assert_eq!(p.status().current_user.as_deref(), Some("alice"));

        let out = p.step(&scene(OPEN, BOB)).unwrap();
        assert_eq!(out.overlays, vec![Overlay::UnknownUser]);
        assert_eq!(out.recognition, Some(Recognition::Unknown));
        assert!(out.auto.is_none());
        assert_eq!(p.status().current_user, None);

        let out = p.step(&scene(OPEN, NOBODY)).unwrap();
        assert_eq!(out.recognition, Some(Recognition::NoFace));
        assert_eq!(out.overlays, vec![Overlay::UnknownUser]);
    }

    #[test]
    fn test_manual_punch_needs_current_user() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        p.set_modes(Modes { auto: false, manual: true });
        p.register(&scene(OPEN, ALICE), "alice").unwrap();
        assert!(matches!(p.punch(Action::PunchIn), Err(PipelineError::NoSubjectRecognized)));

        blink(&mut p, ALICE);
        let c = p.punch(Action::PunchIn).unwrap();
        assert!(c.message.starts_with("Successfully marked PUNCH_IN at "));
        let err = p.punch(Action::PunchIn).unwrap_err();
        assert!(matches!(err, PipelineError::Ledger(LedgerError::CooldownActive { .. })));
        p.punch(Action::PunchOut).unwrap();
        assert_eq!(p.status().last_action.get("alice"), Some(&Action::PunchOut));
    }

    #[test]
    fn test_manual_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        p.set_modes(Modes { auto: true, manual: false });
        assert!(matches!(p.punch(Action::PunchIn), Err(PipelineError::ManualDisabled)));
        assert!(matches!(
            p.punch_subject(1, Action::PunchIn),
            Err(PipelineError::ManualDisabled)
        ));
    }

    #[test]
    fn test_punch_subject_directly() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        let alice = p.register(&scene(OPEN, ALICE), "alice").unwrap();
        p.punch_subject(alice.id, Action::PunchIn).unwrap();
        assert!(matches!(
            p.punch_subject(alice.id + 10, Action::PunchIn),
            Err(PipelineError::Ledger(LedgerError::UnknownSubject(_)))
        ));

        // The session now knows alice punched in; auto mode skips the ledger.
        blink(&mut p, ALICE);
        let out = p.step(&scene(OPEN, ALICE)).unwrap();
        assert!(matches!(out.auto, Some(AutoOutcome::AlreadyLogged { .. })));
    }

    #[test]
    fn test_ledger_cooldown_from_outside_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        let alice = p.register(&scene(OPEN, ALICE), "alice").unwrap();

        let mut other = Ledger::open(dir.path().join("attendance.db"), LedgerConfig::default()).unwrap();
        other.record_at(alice.id, Action::PunchIn, local(9, 0)).unwrap();

        p.step(&scene(CLOSED, ALICE)).unwrap();
        let out = p.step(&scene(OPEN, ALICE)).unwrap();
        assert!(matches!(
            out.auto,
            Some(AutoOutcome::Rejected { error: LedgerError::CooldownActive { .. }, .. })
        ));
        let next = p.step(&scene(OPEN, ALICE)).unwrap();
        assert!(matches!(next.auto, Some(AutoOutcome::AlreadyLogged { .. })));
    }

    #[test]
    fn test_reset_session_requires_new_blink() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        p.register(&scene(OPEN, ALICE), "alice").unwrap();
        blink(&mut p, ALICE);
        assert!(p.status().live);

        p.reset_session();
        let status = p.status();
        assert!(!status.live);
        assert!(status.logged.is_empty());
        assert_eq!(status.current_user, None);
        let out = p.step(&scene(OPEN, ALICE)).unwrap();
        assert_eq!(out.overlays, vec![Overlay::BlinkPrompt]);
    }

    #[test]
    fn test_duplicate_registration_does_not_add_subject() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        p.register(&scene(OPEN, ALICE), "alice").unwrap();
        p.register(&scene(OPEN, BOB), "bob").unwrap();
        let err = p.register(&scene(OPEN, ALICE), "alice2").unwrap_err();
        assert!(matches!(err, PipelineError::Register(RegisterError::DuplicateSubject { .. })));
        assert_eq!(p.gallery_len(), 2);
        assert_eq!(p.ledger.subjects().unwrap().len(), 2);
    }

    #[test]
    fn test_two_faces_do_not_change_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _clock) = pipeline(&dir);
        p.step(&scene(OPEN, ALICE)).unwrap();
        p.step(&scene(TWO_FACES, ALICE)).unwrap();
        assert_eq!(p.status().blink_count, 0);
    }
}
