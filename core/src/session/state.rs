use std::fmt;
use std::time::Duration;

use crate::error::ExecError;

/// Why a session stopped serving commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    /// Closed on request.
    Closed,
    /// The shell exited outside the command protocol.
    Exited,
    /// A command ran past its deadline and the shell was killed.
    TimedOut(Duration),
    WriteFailed,
    HandshakeFailed,
    ProtocolViolation,
    /// A caller stopped waiting after its command was written.
    Abandoned,
}

impl DeathReason {
    pub fn code(self) -> &'static str {
        match self {
            DeathReason::TimedOut(_) => "ETIMEOUT",
            DeathReason::HandshakeFailed => "EHANDSHAKE",
            DeathReason::ProtocolViolation => "EPROTO",
            DeathReason::Abandoned => "EABANDONED",
            DeathReason::Closed | DeathReason::Exited | DeathReason::WriteFailed => "EDIED",
        }
    }

    /// Error handed to callers that reach a session after it died.
    pub(crate) fn to_error(self, pid: u32) -> ExecError {
        match self {
            DeathReason::TimedOut(timeout) => ExecError::Timeout { pid, timeout },
            _ => ExecError::Died { pid },
        }
    }

    /// Whether recording this reason must kill the shell right away. A close
    /// signals the shell itself with a grace period.
    pub(crate) fn needs_kill(self) -> bool {
        !matches!(self, DeathReason::Exited | DeathReason::Closed)
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::Closed => f.write_str("closed"),
            DeathReason::Exited => f.write_str("exited"),
            DeathReason::TimedOut(timeout) => write!(f, "timed out after {}ms", timeout.as_millis()),
            DeathReason::WriteFailed => f.write_str("write failed"),
            DeathReason::HandshakeFailed => f.write_str("handshake failed"),
            DeathReason::ProtocolViolation => f.write_str("protocol violation"),
            DeathReason::Abandoned => f.write_str("abandoned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Spawned; the handshake has not been read yet.
    Starting,
    Idle,
    Busy,
    Dead(DeathReason),
}

impl SessionState {
    pub fn is_dead(self) -> bool {
        matches!(self, SessionState::Dead(_))
    }

    pub fn death_reason(self) -> Option<DeathReason> {
        match self {
            SessionState::Dead(reason) => Some(reason),
            _ => None,
        }
    }
}
