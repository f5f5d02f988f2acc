use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use path_absolutize::Absolutize;
use serde::Deserialize;

use crate::error::ExecError;
use crate::error::Result;
use crate::output::Encoding;

/// Per-call options for [`crate::ShellPool::exec`].
///
/// The timeout can only be set through validating constructors, so a
/// negative value is rejected before any session is involved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawExecOptions")]
pub struct ExecOptions {
    /// Codec applied to stdout and stderr. `None` means UTF-8; unknown names
    /// yield raw bytes.
    pub encoding: Option<String>,
    /// Environment for the serving shell. `None` uses the host environment.
    /// Entries without a value are dropped.
    pub env: Option<HashMap<String, Option<String>>>,
    /// Directory the command runs in. The change does not outlive the call.
    pub cwd: Option<PathBuf>,
    /// Ready-made `NAME=VALUE` pairs used verbatim as the environment key.
    pub env_pairs: Option<Vec<String>>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExecOptions {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    timeout: Option<i64>,
    #[serde(default)]
    env: Option<HashMap<String, Option<String>>>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default, alias = "envPairs")]
    env_pairs: Option<Vec<String>>,
}

impl TryFrom<RawExecOptions> for ExecOptions {
    type Error = ExecError;

    fn try_from(raw: RawExecOptions) -> Result<Self> {
        let options = ExecOptions {
            encoding: raw.encoding,
            env: raw.env,
            cwd: raw.cwd,
            env_pairs: raw.env_pairs,
            timeout: Duration::ZERO,
        };
        match raw.timeout {
            Some(ms) => options.with_timeout_ms(ms),
            None => Ok(options),
        }
    }
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encoding(mut self, name: impl Into<String>) -> Self {
        self.encoding = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Zero disables the timeout; negative values are a caller error.
    pub fn with_timeout_ms(mut self, ms: i64) -> Result<Self> {
        let ms = u64::try_from(ms).map_err(|_| ExecError::InvalidTimeout { value: ms })?;
        self.timeout = Duration::from_millis(ms);
        Ok(self)
    }

    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            env.into_iter()
                .map(|(name, value)| (name.into(), Some(value.into())))
                .collect(),
        );
        self
    }

    pub fn with_env_map(mut self, env: HashMap<String, Option<String>>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env_pairs<I, S>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_pairs = Some(pairs.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
            .as_deref()
            .map_or(Encoding::Utf8, Encoding::from_name)
    }
}

/// A validated command line ready to be written to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    line: String,
    timeout: Duration,
}

impl CommandRequest {
    /// The command must fit on one line: the wrapper reads commands
    /// newline-terminated.
    pub fn new(command: &str) -> Result<Self> {
        if command.contains('\n') {
            return Err(ExecError::InvalidCommand {
                reason: "command must not contain newlines".to_string(),
            });
        }
        if command.contains('\0') {
            return Err(ExecError::InvalidCommand {
                reason: "command must not contain NUL bytes".to_string(),
            });
        }
        Ok(Self {
            line: command.to_string(),
            timeout: Duration::ZERO,
        })
    }

    pub fn from_options(command: &str, options: &ExecOptions) -> Result<Self> {
        let request = Self::new(command)?.with_timeout(options.timeout());
        match options.cwd.as_deref() {
            Some(cwd) => request.in_dir(cwd),
            None => Ok(request),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the command in `cwd` inside a subshell, so neither the directory
    /// change nor anything else the line mutates leaks into later commands.
    pub fn in_dir(mut self, cwd: &Path) -> Result<Self> {
        let cwd = cwd.absolutize().map_err(|err| ExecError::InvalidCommand {
            reason: format!("cannot resolve working directory {}: {err}", cwd.display()),
        })?;
        let cwd = cwd.to_str().ok_or_else(|| ExecError::InvalidCommand {
            reason: format!("working directory {} is not valid UTF-8", cwd.display()),
        })?;
        let quoted_dir = quote(cwd)?;
        let quoted_line = quote(&self.line)?;
        self.line = format!("(builtin cd -- {quoted_dir} && eval {quoted_line})");
        Ok(self)
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn quote(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(Cow::into_owned)
        .map_err(|err| ExecError::InvalidCommand {
            reason: err.to_string(),
        })
}
