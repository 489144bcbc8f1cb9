//! Session lifecycle.
//!
//! The adapter is born waiting for a client, initialized by the DAP
//! handshake, runs or steps the script, and terminates on disconnect. The
//! idle tick rebirths a terminated session so a new client can attach.
//! "Stopped" is not a state: it is the inner command loop the hook enters
//! while the script is frozen.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Birth = 0,
    Initialized = 1,
    Running = 2,
    Stepping = 3,
    Terminated = 4,
}

impl SessionState {
    /// The name used in "not yet implemented" error responses.
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Birth => "birth",
            SessionState::Initialized => "initialized",
            SessionState::Running => "running",
            SessionState::Stepping => "stepping",
            SessionState::Terminated => "terminated",
        }
    }

    pub(crate) fn from_u8(raw: u8) -> SessionState {
        match raw {
            0 => SessionState::Birth,
            1 => SessionState::Initialized,
            2 => SessionState::Running,
            3 => SessionState::Stepping,
            _ => SessionState::Terminated,
        }
    }

    /// Whether the hook should observe trace events at all in this state.
    pub fn hook_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stepping)
    }
}
