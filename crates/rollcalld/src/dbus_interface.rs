use crate::engine::{EngineError, EngineHandle};
use crate::pipeline::Modes;
use rollcall_ledger::Action;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn failed(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn parse_action(action: &str) -> zbus::fdo::Result<Action> {
    action
        .parse::<Action>()
        .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Punch the subject currently recognized at the camera.
    /// Returns the confirmation message.
    async fn punch(&self, action: &str) -> zbus::fdo::Result<String> {
        tracing::info!(action, "punch requested");
        let action = parse_action(action)?;
        let confirmation = self.engine.punch(action).await.map_err(failed)?;
        Ok(confirmation.message)
    }

    /// Punch an explicit subject by ledger id.
    async fn punch_subject(&self, subject_id: i64, action: &str) -> zbus::fdo::Result<String> {
        tracing::info!(subject_id, action, "punch_subject requested");
        let action = parse_action(action)?;
        let confirmation = self
            .engine
            .punch_subject(subject_id, action)
            .await
            .map_err(failed)?;
        Ok(confirmation.message)
    }

    /// Enroll the face currently in front of the camera. Returns the new subject id.
    async fn register(&self, name: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(name, "register requested");
        let subject = self.engine.register(name).await.map_err(failed)?;
        Ok(subject.id)
    }

    /// Clear the session and require a fresh blink.
    async fn reset_session(&self) -> zbus::fdo::Result<()> {
        self.engine.reset_session().await.map_err(failed)
    }

    async fn set_modes(&self, auto: bool, manual: bool) -> zbus::fdo::Result<()> {
        self.engine
            .set_modes(Modes { auto, manual })
            .await
            .map_err(failed)
    }

    /// Latest processed frame as `(width, height, packed RGB)`.
    async fn snapshot(&self) -> zbus::fdo::Result<(u32, u32, Vec<u8>)> {
        match self.engine.snapshot().await.map_err(failed)? {
            Some(frame) => Ok((frame.width, frame.height, frame.data)),
            None => Err(zbus::fdo::Error::Failed("no frame processed yet".into())),
        }
    }

    /// Return daemon status as a JSON document.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        serde_json::to_string(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
