use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::framing::FrameError;
use crate::output::Output;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The timeout was negative or otherwise unusable. Raised before any
    /// session is touched.
    #[error("timeout needs to be a non-negative number of milliseconds, got {value}")]
    InvalidTimeout { value: i64 },

    #[error("invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Exit code: {code}")]
    NonZeroExit {
        code: u8,
        stdout: Output,
        stderr: Output,
    },

    #[error("unexpected exit of shell process {pid}")]
    Died { pid: u32 },

    #[error("Timeout after {}ms", timeout.as_millis())]
    Timeout { pid: u32, timeout: Duration },

    /// The exit code is known but the staged stderr could not be read back.
    #[error("Cannot read stderr (exit code {code}): {source}")]
    DiagnosticChannelLost {
        code: u8,
        stdout: Vec<u8>,
        #[source]
        source: io::Error,
    },

    #[error("shell handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("failed to spawn shell `{shell}`: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: io::Error,
    },

    #[error("shell output violated the framing protocol: {0}")]
    Protocol(#[from] FrameError),
}

impl ExecError {
    /// Stable identifier for the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::InvalidTimeout { .. } | ExecError::InvalidCommand { .. } => "EINVAL",
            ExecError::NonZeroExit { .. } => "EEXIT",
            ExecError::Died { .. } => "EDIED",
            ExecError::Timeout { .. } => "ETIMEOUT",
            ExecError::DiagnosticChannelLost { .. } => "ENOERRFILE",
            ExecError::Handshake { .. } => "EHANDSHAKE",
            ExecError::Spawn { .. } => "ESPAWN",
            ExecError::Protocol(_) => "EPROTO",
        }
    }

    pub fn exit_code(&self) -> Option<u8> {
        match self {
            ExecError::NonZeroExit { code, .. }
            | ExecError::DiagnosticChannelLost { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExecError::InvalidTimeout { .. } | ExecError::InvalidCommand { .. }
        )
    }

    /// Whether the failure took the serving session down with it.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ExecError::Died { .. }
                | ExecError::Timeout { .. }
                | ExecError::Handshake { .. }
                | ExecError::Protocol(_)
        )
    }

    pub fn stderr(&self) -> Option<&Output> {
        match self {
            ExecError::NonZeroExit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    pub fn stdout(&self) -> Option<&Output> {
        match self {
            ExecError::NonZeroExit { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}
