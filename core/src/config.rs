use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_SHELL: &str = "/bin/bash";
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CLOSE_GRACE_MS: u64 = 2_000;
/// Coverage output location used by LLVM source-based coverage.
const DEFAULT_COVERAGE_VAR: &str = "LLVM_PROFILE_FILE";

/// How a command's stderr travels back from the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrTransport {
    /// Only the exit code travels inline; stderr is read from the staged file
    /// when the exit code is nonzero.
    #[default]
    Staged,
    /// Stderr is length-prefixed inside the record when the exit code is
    /// nonzero.
    Inline,
}

impl StderrTransport {
    pub(crate) fn as_arg(self) -> &'static str {
        match self {
            StderrTransport::Staged => "staged",
            StderrTransport::Inline => "inline",
        }
    }
}

/// Where command lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputChannel {
    #[default]
    Stdin,
    /// A named pipe created by the wrapper and reported in its handshake.
    Fifo,
}

impl InputChannel {
    pub(crate) fn as_arg(self) -> &'static str {
        match self {
            InputChannel::Stdin => "stdin",
            InputChannel::Fifo => "fifo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellPoolConfig {
    pub shell: PathBuf,
    pub stderr_transport: StderrTransport,
    pub input_channel: InputChannel,
    /// Base directory for per-session staging. Falls back to the host temp dir.
    pub temp_dir: Option<PathBuf>,
    pub handshake_timeout_ms: u64,
    pub close_grace_ms: u64,
    /// Coverage variable carried over from the host environment. An empty
    /// name disables the propagation.
    pub coverage_var: Option<String>,
}

impl Default for ShellPoolConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            stderr_transport: StderrTransport::default(),
            input_channel: InputChannel::default(),
            temp_dir: None,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            coverage_var: Some(DEFAULT_COVERAGE_VAR.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid shell pool config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ShellPoolConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn coverage_var(&self) -> Option<&str> {
        self.coverage_var.as_deref().filter(|name| !name.is_empty())
    }

    pub(crate) fn staging_base(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
