//! A pool of persistent shells that run commands without paying for a fresh
//! process per call.
//!
//! Each distinct environment gets one long-lived `bash` running a small
//! command loop. Commands are written to it one at a time and their exit
//! code, stdout and stderr come back as length-prefixed records, so binary
//! output and embedded newlines survive intact.

mod command_lock;
mod config;
mod env_key;
mod error;
mod exec_options;
mod framing;
mod output;
mod pool;
mod process_death;
mod session;
mod timeout_guard;

pub use config::ConfigError;
pub use config::InputChannel;
pub use config::ShellPoolConfig;
pub use config::StderrTransport;
pub use env_key::EnvironmentKey;
pub use error::ExecError;
pub use error::Result;
pub use exec_options::CommandRequest;
pub use exec_options::ExecOptions;
pub use framing::Frame;
pub use framing::FrameDecoder;
pub use framing::FrameError;
pub use framing::Handshake;
pub use output::Encoding;
pub use output::Output;
pub use pool::ExecOutput;
pub use pool::ShellPool;
pub use session::CommandResult;
pub use session::DeathReason;
pub use session::SessionState;
pub use session::ShellSession;
