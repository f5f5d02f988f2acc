//! Pull-based decoder for the byte stream a wrapper shell writes to stdout.
//!
//! The stream starts with a single handshake line, followed by one record per
//! command:
//!
//! ```text
//! EE LLLLLLLLLLLLLL <stdout bytes> LLLLLLLLLLLLLL <stderr bytes>
//! ```
//!
//! `EE` is the exit code as two hex digits and each `L` field is a 14 digit
//! hex length. Payloads are length-prefixed so they may carry arbitrary bytes,
//! newlines included. Chunk boundaries never need to line up with record
//! boundaries: bytes are appended as they arrive and a record is only handed
//! out once it is complete.

use std::path::Path;
use std::path::PathBuf;

use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;

pub const EXIT_CODE_WIDTH: usize = 2;
pub const LENGTH_WIDTH: usize = 14;
pub const HANDSHAKE_MARKER: &str = "@shellpool";
pub const PROTOCOL_VERSION: &str = "1";
pub const MAX_HANDSHAKE_LINE: usize = 4096;

const HEADER_LEN: usize = EXIT_CODE_WIDTH + LENGTH_WIDTH;
/// Placeholder the wrapper prints when it reads commands from stdin.
const NO_INPUT_PATH: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// File the wrapper redirects each command's stderr into.
    pub stderr_path: PathBuf,
    /// Named pipe to write command lines to instead of stdin, when the
    /// wrapper was started in fifo mode.
    pub input_path: Option<PathBuf>,
}

impl Handshake {
    /// Per-session directory holding the staged files.
    pub fn staging_dir(&self) -> Option<&Path> {
        self.stderr_path.parent()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub exit_code: u8,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid hex in {field} field: {found:?}")]
    InvalidHex { field: &'static str, found: String },

    #[error("{field} of {length} bytes is not addressable")]
    LengthOverflow { field: &'static str, length: u64 },

    #[error("malformed handshake: {0}")]
    Handshake(String),

    #[error("handshake line exceeds {MAX_HANDSHAKE_LINE} bytes")]
    HandshakeTooLong,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Consumes the handshake line once it has fully arrived.
    pub fn next_handshake(&mut self) -> Result<Option<Handshake>, FrameError> {
        let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_HANDSHAKE_LINE {
                return Err(FrameError::HandshakeTooLong);
            }
            return Ok(None);
        };
        if newline > MAX_HANDSHAKE_LINE {
            return Err(FrameError::HandshakeTooLong);
        }

        let line = self.buf.split_to(newline + 1);
        let line = std::str::from_utf8(&line[..newline])
            .map_err(|_| FrameError::Handshake("line is not valid UTF-8".to_string()))?;
        parse_handshake(line).map(Some)
    }

    /// Extracts one complete record, leaving any trailing bytes buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let exit_code = parse_hex(&self.buf[..EXIT_CODE_WIDTH], "exit code")?;
        let stdout_len = parse_len(&self.buf[EXIT_CODE_WIDTH..HEADER_LEN], "stdout length")?;

        let stderr_header = checked_add(HEADER_LEN, stdout_len, "stdout length")?;
        let stderr_start = checked_add(stderr_header, LENGTH_WIDTH, "stdout length")?;
        if self.buf.len() < stderr_start {
            return Ok(None);
        }
        let stderr_len = parse_len(&self.buf[stderr_header..stderr_start], "stderr length")?;
        let end = checked_add(stderr_start, stderr_len, "stderr length")?;
        if self.buf.len() < end {
            return Ok(None);
        }

        let record = self.buf.split_to(end).freeze();
        Ok(Some(Frame {
            // Two hex digits always fit.
            exit_code: exit_code as u8,
            stdout: record.slice(HEADER_LEN..stderr_header),
            stderr: record.slice(stderr_start..end),
        }))
    }
}

fn parse_handshake(line: &str) -> Result<Handshake, FrameError> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [marker, version, stderr_path, input_path] = fields.as_slice() else {
        return Err(FrameError::Handshake(format!(
            "expected 4 tab separated fields, got {}",
            fields.len()
        )));
    };
    if *marker != HANDSHAKE_MARKER {
        return Err(FrameError::Handshake(format!("unexpected marker {marker:?}")));
    }
    if *version != PROTOCOL_VERSION {
        return Err(FrameError::Handshake(format!(
            "unsupported protocol version {version:?}"
        )));
    }

    let stderr_path = absolute_path(stderr_path, "stderr path")?;
    let input_path = match *input_path {
        NO_INPUT_PATH => None,
        path => Some(absolute_path(path, "input path")?),
    };
    Ok(Handshake {
        stderr_path,
        input_path,
    })
}

fn absolute_path(raw: &str, what: &str) -> Result<PathBuf, FrameError> {
    let path = PathBuf::from(raw);
    if raw.is_empty() || !path.is_absolute() {
        return Err(FrameError::Handshake(format!(
            "{what} must be absolute, got {raw:?}"
        )));
    }
    Ok(path)
}

fn parse_hex(field: &[u8], name: &'static str) -> Result<u64, FrameError> {
    let invalid = || FrameError::InvalidHex {
        field: name,
        found: String::from_utf8_lossy(field).into_owned(),
    };
    if !field.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let digits = std::str::from_utf8(field).map_err(|_| invalid())?;
    u64::from_str_radix(digits, 16).map_err(|_| invalid())
}

fn parse_len(field: &[u8], name: &'static str) -> Result<usize, FrameError> {
    let length = parse_hex(field, name)?;
    usize::try_from(length).map_err(|_| FrameError::LengthOverflow {
        field: name,
        length,
    })
}

fn checked_add(a: usize, b: usize, name: &'static str) -> Result<usize, FrameError> {
    a.checked_add(b).ok_or(FrameError::LengthOverflow {
        field: name,
        length: b as u64,
    })
}

/// Encodes a record the way the wrapper does. Used by tests.
#[cfg(test)]
pub(crate) fn encode_frame(exit_code: u8, stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    let mut out = format!("{exit_code:02x}{:014x}", stdout.len()).into_bytes();
    out.extend_from_slice(stdout);
    out.extend_from_slice(format!("{:014x}", stderr.len()).as_bytes());
    out.extend_from_slice(stderr);
    out
}
