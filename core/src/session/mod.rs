//! One persistent wrapper shell serving commands one at a time.
//!
//! A session goes `Starting -> Idle <-> Busy -> Dead`. The handshake is read
//! by the first caller that takes the command lock. Every path into `Dead`
//! funnels through [`ShellSession::mark_dead`], which runs its teardown
//! exactly once no matter how many triggers race for it.

mod process;
mod state;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard as StdMutexGuard;
use std::sync::PoisonError;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

pub use state::DeathReason;
pub use state::SessionState;

use crate::command_lock::CommandLock;
use crate::config::ShellPoolConfig;
use crate::config::StderrTransport;
use crate::env_key::EnvironmentKey;
use crate::error::ExecError;
use crate::error::Result;
use crate::exec_options::CommandRequest;
use crate::framing::Frame;
use crate::framing::FrameDecoder;
use crate::framing::Handshake;
use crate::timeout_guard::TimeoutGuard;
use process::Signal;

/// Outcome of one command. A nonzero exit code is data here, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: u8,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub(crate) type DeathHook = Box<dyn FnOnce() + Send>;

pub struct ShellSession {
    id: u64,
    pid: u32,
    key: EnvironmentKey,
    config: Arc<ShellPoolConfig>,
    state: StdMutex<SessionState>,
    io: CommandLock<SessionIo>,
    signals: mpsc::UnboundedSender<Signal>,
    dead: CancellationToken,
    exited: CancellationToken,
    staging_dir: StdMutex<Option<PathBuf>>,
    on_death: StdMutex<Option<DeathHook>>,
}

/// Everything that may only be touched by the holder of the command lock.
struct SessionIo {
    input: Option<CommandInput>,
    chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    decoder: FrameDecoder,
    handshake: Option<Handshake>,
}

enum CommandInput {
    Stdin(ChildStdin),
    Fifo(File),
}

impl CommandInput {
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        match self {
            CommandInput::Stdin(stdin) => {
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            }
            CommandInput::Fifo(fifo) => {
                fifo.write_all(&bytes).await?;
                fifo.flush().await
            }
        }
    }
}

impl ShellSession {
    /// Spawns the wrapper shell. `on_death` runs once, when the session
    /// becomes dead for any reason.
    pub(crate) fn spawn(
        id: u64,
        key: EnvironmentKey,
        config: Arc<ShellPoolConfig>,
        on_death: DeathHook,
    ) -> Result<Arc<Self>> {
        let shell = process::spawn_shell(&config, &key, id)?;
        let session = Arc::new(Self {
            id,
            pid: shell.pid,
            key,
            config,
            state: StdMutex::new(SessionState::Starting),
            io: CommandLock::new(SessionIo {
                input: shell.stdin.map(CommandInput::Stdin),
                chunks: shell.chunks,
                decoder: FrameDecoder::new(),
                handshake: None,
            }),
            signals: shell.signals,
            dead: CancellationToken::new(),
            exited: shell.exited,
            staging_dir: StdMutex::new(None),
            on_death: StdMutex::new(Some(on_death)),
        });

        let weak = Arc::downgrade(&session);
        let exited = session.exited.clone();
        tokio::spawn(async move {
            exited.cancelled().await;
            if let Some(session) = weak.upgrade() {
                session.mark_dead(DeathReason::Exited);
            }
        });
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn key(&self) -> &EnvironmentKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_dead(&self) -> bool {
        self.state().is_dead()
    }

    /// Callers waiting behind the command currently in flight.
    pub fn queued(&self) -> usize {
        self.io.queued()
    }

    /// Runs one command. Callers are served in the order they arrived.
    pub async fn exec(&self, request: &CommandRequest) -> Result<CommandResult> {
        let mut io = self.io.acquire().await;
        // A shell that died before its handshake was read still reports the
        // handshake failure, whichever of exit and read is observed first.
        if self.state().death_reason() != Some(DeathReason::Closed) {
            self.ensure_handshake(&mut io).await?;
        }
        if let Some(reason) = self.state().death_reason() {
            return Err(reason.to_error(self.pid));
        }

        self.transition(SessionState::Busy);
        let mut in_flight = InFlight::new(self);
        let Some(input) = io.input.as_mut() else {
            in_flight.disarm();
            return Err(self.fail(DeathReason::WriteFailed));
        };
        if let Err(err) = input.send_line(request.line()).await {
            warn!(pid = self.pid, session_id = self.id, "failed to write command: {err}");
            in_flight.disarm();
            return Err(self.fail(DeathReason::WriteFailed));
        }

        let timeout = request.timeout();
        let mut guard = TimeoutGuard::arm(timeout);
        trace!(
            pid = self.pid,
            session_id = self.id,
            timeout_armed = guard.is_armed(),
            "command written"
        );
        let frame = tokio::select! {
            biased;
            frame = self.read_frame(&mut io) => frame,
            () = guard.expired() => {
                in_flight.disarm();
                info!(pid = self.pid, session_id = self.id, timeout_ms = timeout.as_millis() as u64, "command timed out, killing shell");
                return Err(self.fail(DeathReason::TimedOut(timeout)));
            }
        };
        in_flight.disarm();
        let frame = frame?;
        trace!(
            pid = self.pid,
            code = frame.exit_code,
            bytes = frame.stdout.len(),
            "decoded record"
        );

        let result = self.collect_stderr(&io, frame).await;
        self.transition(SessionState::Idle);
        result
    }

    /// Terminates the shell once any in-flight command has finished. Resolves
    /// after the process has been reaped.
    pub async fn close(&self) {
        let mut io = self.io.acquire().await;
        if self.mark_dead(DeathReason::Closed) {
            // EOF on stdin ends the wrapper loop; SIGTERM covers fifo mode.
            io.input = None;
            let _ = self.signals.send(Signal::Terminate);
            let grace = self.config.close_grace();
            if tokio::time::timeout(grace, self.exited.cancelled())
                .await
                .is_err()
            {
                warn!(
                    pid = self.pid,
                    session_id = self.id,
                    grace_ms = grace.as_millis() as u64,
                    "shell ignored SIGTERM, killing"
                );
                let _ = self.signals.send(Signal::Kill);
            }
        }
        self.exited.cancelled().await;
    }

    /// Moves the session to `Dead`. Returns `false` if it already was.
    pub(crate) fn mark_dead(&self, reason: DeathReason) -> bool {
        {
            let mut state = lock(&self.state);
            if state.is_dead() {
                return false;
            }
            *state = SessionState::Dead(reason);
        }
        self.dead.cancel();
        if reason.needs_kill() {
            let _ = self.signals.send(Signal::Kill);
        }
        self.remove_staging_dir();
        let hook = lock(&self.on_death).take();
        if let Some(hook) = hook {
            hook();
        }
        match reason {
            DeathReason::Closed => debug!(pid = self.pid, session_id = self.id, "shell session closed"),
            _ => info!(
                pid = self.pid,
                session_id = self.id,
                reason = %reason,
                code = reason.code(),
                "shell session died"
            ),
        }
        true
    }

    fn fail(&self, reason: DeathReason) -> ExecError {
        self.mark_dead(reason);
        self.death_error()
    }

    fn death_error(&self) -> ExecError {
        self.state()
            .death_reason()
            .unwrap_or(DeathReason::Exited)
            .to_error(self.pid)
    }

    fn transition(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if !state.is_dead() {
            *state = next;
        }
    }

    async fn ensure_handshake(&self, io: &mut SessionIo) -> Result<()> {
        if io.handshake.is_some() {
            return Ok(());
        }
        let limit = self.config.handshake_timeout();
        let handshake = match tokio::time::timeout(limit, read_handshake(io)).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(reason)) => return Err(self.handshake_failed(reason)),
            Err(_) => {
                return Err(self.handshake_failed(format!(
                    "no handshake within {}ms",
                    limit.as_millis()
                )));
            }
        };

        *lock(&self.staging_dir) = handshake.staging_dir().map(PathBuf::from);
        if let Some(path) = &handshake.input_path {
            match process::open_input_fifo(path) {
                Ok(fifo) => io.input = Some(CommandInput::Fifo(fifo)),
                Err(err) => {
                    return Err(self.handshake_failed(format!(
                        "cannot open input fifo {}: {err}",
                        path.display()
                    )));
                }
            }
        }
        // Teardown may have raced the handshake and missed the directory.
        if self.is_dead() {
            self.remove_staging_dir();
        }
        debug!(
            pid = self.pid,
            session_id = self.id,
            stderr_path = %handshake.stderr_path.display(),
            fifo = handshake.input_path.is_some(),
            "shell handshake complete"
        );
        io.handshake = Some(handshake);
        self.transition(SessionState::Idle);
        Ok(())
    }

    fn handshake_failed(&self, reason: String) -> ExecError {
        warn!(pid = self.pid, session_id = self.id, "shell handshake failed: {reason}");
        self.mark_dead(DeathReason::HandshakeFailed);
        ExecError::Handshake { reason }
    }

    async fn read_frame(&self, io: &mut SessionIo) -> Result<Frame> {
        loop {
            match io.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(err) => {
                    warn!(pid = self.pid, session_id = self.id, "malformed record: {err}");
                    self.mark_dead(DeathReason::ProtocolViolation);
                    return Err(err.into());
                }
            }
            let chunk = tokio::select! {
                biased;
                chunk = io.chunks.recv() => chunk,
                () = self.dead.cancelled() => None,
            };
            match chunk {
                Some(chunk) => io.decoder.push(&chunk),
                None => {
                    // Bytes already read before the shell went away may still
                    // complete the record.
                    while let Ok(chunk) = io.chunks.try_recv() {
                        io.decoder.push(&chunk);
                    }
                    if let Ok(Some(frame)) = io.decoder.next_frame() {
                        return Ok(frame);
                    }
                    return Err(self.fail(DeathReason::Exited));
                }
            }
        }
    }

    async fn collect_stderr(&self, io: &SessionIo, frame: Frame) -> Result<CommandResult> {
        let exit_code = frame.exit_code;
        let stdout = frame.stdout.to_vec();
        if exit_code == 0 {
            return Ok(CommandResult {
                exit_code,
                stdout,
                stderr: Vec::new(),
            });
        }
        let stderr = match (self.config.stderr_transport, io.handshake.as_ref()) {
            (StderrTransport::Inline, _) => frame.stderr.to_vec(),
            (StderrTransport::Staged, Some(handshake)) => {
                match tokio::fs::read(&handshake.stderr_path).await {
                    Ok(stderr) => stderr,
                    Err(source) => {
                        warn!(
                            pid = self.pid,
                            code = exit_code,
                            "cannot read staged stderr: {source}"
                        );
                        return Err(ExecError::DiagnosticChannelLost {
                            code: exit_code,
                            stdout,
                            source,
                        });
                    }
                }
            }
            (StderrTransport::Staged, None) => {
                return Err(ExecError::DiagnosticChannelLost {
                    code: exit_code,
                    stdout,
                    source: io::Error::new(io::ErrorKind::NotFound, "no staged stderr path"),
                });
            }
        };
        Ok(CommandResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn remove_staging_dir(&self) {
        let Some(dir) = lock(&self.staging_dir).take() else {
            return;
        };
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => trace!(session_id = self.id, dir = %dir.display(), "removed staging dir"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                session_id = self.id,
                dir = %dir.display(),
                "failed to remove staging dir: {err}"
            ),
        }
    }
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn read_handshake(io: &mut SessionIo) -> std::result::Result<Handshake, String> {
    loop {
        if let Some(handshake) = io.decoder.next_handshake().map_err(|err| format!("{err}"))? {
            return Ok(handshake);
        }
        match io.chunks.recv().await {
            Some(chunk) => io.decoder.push(&chunk),
            None => return Err("shell exited before the handshake".to_string()),
        }
    }
}

/// Poisons the session if the `exec` future is dropped between writing a
/// command and reading its record.
struct InFlight<'a> {
    session: &'a ShellSession,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(session: &'a ShellSession) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.mark_dead(DeathReason::Abandoned);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
