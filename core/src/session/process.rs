use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::config::InputChannel;
use crate::config::ShellPoolConfig;
use crate::env_key::EnvironmentKey;
use crate::error::ExecError;
use crate::error::Result;
use crate::process_death;

const WRAPPER_SCRIPT: &str = include_str!("wrapper.sh");
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Requests delivered to the task that owns the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// SIGTERM to the shell only; it runs its EXIT trap.
    Terminate,
    /// SIGKILL to the whole process group.
    Kill,
}

/// A running wrapper shell, already split into the pieces a session owns.
#[derive(Debug)]
pub(crate) struct ShellProcess {
    pub(crate) pid: u32,
    /// `None` in fifo mode, where stdin is not connected.
    pub(crate) stdin: Option<ChildStdin>,
    /// Raw stdout chunks. Closed at EOF.
    pub(crate) chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Dropping every sender kills the process group.
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
    /// Cancelled once the process has been reaped.
    pub(crate) exited: CancellationToken,
}

pub(crate) fn spawn_shell(
    config: &ShellPoolConfig,
    key: &EnvironmentKey,
    session_id: u64,
) -> Result<ShellProcess> {
    let shell = config.shell.display().to_string();
    let spawn_error = |source: io::Error| ExecError::Spawn {
        shell: shell.clone(),
        source,
    };

    let mut command = Command::new(&config.shell);
    command
        .arg("-c")
        .arg(WRAPPER_SCRIPT)
        .arg("shellpool")
        .arg(config.stderr_transport.as_arg())
        .arg(config.input_channel.as_arg())
        .arg(config.staging_base())
        .env_clear()
        .envs(key.vars())
        .stdin(match config.input_channel {
            InputChannel::Stdin => Stdio::piped(),
            InputChannel::Fifo => Stdio::null(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    process_death::harden(&mut command);

    let mut child = command.spawn().map_err(spawn_error)?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_error(io::Error::other("shell exited before reporting a pid")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error(io::Error::other("stdout pipe missing")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_error(io::Error::other("stderr pipe missing")))?;
    let stdin = child.stdin.take();

    let (chunk_tx, chunks) = mpsc::unbounded_channel();
    let (signals, signal_rx) = mpsc::unbounded_channel();
    let exited = CancellationToken::new();

    tokio::spawn(read_stdout(stdout, chunk_tx, pid));
    tokio::spawn(forward_wrapper_stderr(stderr, pid, session_id));
    tokio::spawn(supervise(child, pid, session_id, signal_rx, exited.clone()));

    debug!(pid, session_id, vars = key.len(), shell = %shell, "spawned shell session");
    Ok(ShellProcess {
        pid,
        stdin,
        chunks,
        signals,
        exited,
    })
}

/// Opens the wrapper's input fifo for writing. The open is non-blocking so a
/// wrapper that no longer holds the read end yields `ENXIO` instead of a hang;
/// writes block as usual afterwards.
pub(crate) fn open_input_fifo(path: &Path) -> io::Result<tokio::fs::File> {
    let fifo = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let fd = fifo.as_raw_fd();
    // SAFETY: fcntl on a descriptor owned by `fifo`.
    let rc = unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            flags
        } else {
            libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK)
        }
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(tokio::fs::File::from_std(fifo))
}

async fn read_stdout(mut stdout: ChildStdout, tx: mpsc::UnboundedSender<Vec<u8>>, pid: u32) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(pid, bytes = n, "shell stdout chunk");
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(pid, "reading shell stdout failed: {err}");
                break;
            }
        }
    }
}

/// The wrapper redirects every command's stderr, so anything arriving here
/// comes from the wrapper itself. Lines need not be UTF-8; the pipe is
/// drained until EOF either way.
async fn forward_wrapper_stderr<R>(stderr: R, pid: u32, session_id: u64)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!(pid, session_id, "wrapper stderr: {}", text.trim_end());
            }
            Err(err) => {
                debug!(pid, session_id, "wrapper stderr closed: {err}");
                break;
            }
        }
    }
}

/// Owns the child: reaps it and delivers signals while it is alive.
async fn supervise(
    mut child: Child,
    pid: u32,
    session_id: u64,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exited: CancellationToken,
) {
    let mut session_alive = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv(), if session_alive => match signal {
                Some(Signal::Terminate) => {
                    if let Err(err) = process_death::terminate(pid) {
                        warn!(pid, session_id, "failed to terminate shell: {err}");
                    }
                }
                Some(Signal::Kill) => kill(&mut child, pid, session_id),
                None => {
                    // The session was dropped without closing.
                    session_alive = false;
                    kill(&mut child, pid, session_id);
                }
            },
        }
    };

    match status {
        Ok(status) => debug!(pid, session_id, %status, "shell exited"),
        Err(err) => warn!(pid, session_id, "failed to wait for shell: {err}"),
    }
    exited.cancel();
}

fn kill(child: &mut Child, pid: u32, session_id: u64) {
    if let Err(err) = process_death::kill_group(pid) {
        warn!(pid, session_id, "failed to kill shell process group: {err}");
    }
    if let Err(err) = child.start_kill() {
        // Already reaped or never started; either way nothing is left to kill.
        trace!(pid, session_id, "start_kill: {err}");
    }
}
