//! Per-run bookkeeping for the attendance station.
//!
//! None of this is authoritative; the ledger decides what gets recorded.
//! The logged set only stops auto mode from re-submitting a punch the
//! session already made.

use rollcall_ledger::Action;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// The subject a manual trigger applies to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentUser {
    pub name: String,
    pub confidence: f32,
}

#[derive(Debug, Default)]
pub struct Session {
    logged: BTreeSet<(String, Action)>,
    last_action: BTreeMap<String, Action>,
    current: Option<CurrentUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedEntry {
    pub name: String,
    pub action: Action,
}

/// Snapshot of [`Session`] plus liveness, as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub logged: Vec<LoggedEntry>,
    pub last_action: BTreeMap<String, Action>,
    pub current_user: Option<String>,
    pub current_confidence: f32,
    pub live: bool,
    pub blink_count: u32,
}

impl Session {
    pub fn already_logged(&self, name: &str, action: Action) -> bool {
        self.logged.contains(&(name.to_string(), action))
    }

    pub fn mark_logged(&mut self, name: &str, action: Action) {
        self.logged.insert((name.to_string(), action));
        self.last_action.insert(name.to_string(), action);
    }

    pub fn last_action(&self, name: &str) -> Option<Action> {
        self.last_action.get(name).copied()
    }

    pub fn set_current(&mut self, name: &str, confidence: f32) {
        self.current = Some(CurrentUser {
            name: name.to_string(),
            confidence,
        });
    }

    pub fn clear_current(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&CurrentUser> {
        self.current.as_ref()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn status(&self, live: bool, blink_count: u32) -> SessionStatus {
        SessionStatus {
            logged: self
                .logged
                .iter()
                .map(|(name, action)| LoggedEntry {
                    name: name.clone(),
                    action: *action,
                })
                .collect(),
            last_action: self.last_action.clone(),
            current_user: self.current.as_ref().map(|c| c.name.clone()),
            current_confidence: self.current.as_ref().map_or(0.0, |c| c.confidence),
            live,
            blink_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logged_is_per_action() {
        let mut s = Session::default();
        s.mark_logged("alice", Action::PunchIn);
        assert!(s.already_logged("alice", Action::PunchIn));
        assert!(!s.already_logged("alice", Action::PunchOut));
        assert!(!s.already_logged("bob", Action::PunchIn));
    }

    #[test]
    fn test_last_action_tracks_latest() {
        let mut s = Session::default();
        s.mark_logged("alice", Action::PunchIn);
        s.mark_logged("alice", Action::PunchOut);
        assert_eq!(s.last_action("alice"), Some(Action::PunchOut));
        assert_eq!(s.last_action("bob"), None);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut s = Session::default();
        s.mark_logged("alice", Action::PunchIn);
        s.set_current("alice", 0.8);
        s.reset();
        let status = s.status(false, 0);
        assert!(status.logged.is_empty());
        assert!(status.last_action.is_empty());
        assert_eq!(status.current_user, None);
        assert_eq!(status.current_confidence, 0.0);
    }

    #[test]
    fn test_status_snapshot() {
        let mut s = Session::default();
        s.set_current("bob", 0.75);
        s.mark_logged("bob", Action::PunchIn);
        let status = s.status(true, 2);
        assert_eq!(status.current_user.as_deref(), Some("bob"));
        assert_eq!(status.logged, vec![LoggedEntry { name: "bob".into(), action: Action::PunchIn }]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["last_action"]["bob"], "PUNCH_IN");
        assert_eq!(json["blink_count"], 2);
    }
}
