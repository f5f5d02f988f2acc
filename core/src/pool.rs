use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard as StdMutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::info;

use crate::config::ShellPoolConfig;
use crate::env_key::EnvironmentKey;
use crate::error::ExecError;
use crate::error::Result;
use crate::exec_options::CommandRequest;
use crate::exec_options::ExecOptions;
use crate::output::Output;
use crate::session::CommandResult;
use crate::session::ShellSession;

/// Decoded output of a command that exited with code zero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: Output,
    pub stderr: Output,
}

/// Long-lived shells keyed by canonical environment.
///
/// Cloning is cheap and every clone shares the same sessions. Sessions die on
/// their own (exit, timeout, protocol failure) and evict themselves; the next
/// call for the same environment spawns a replacement. Dropping the last clone
/// kills every shell still running.
#[derive(Clone)]
pub struct ShellPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Arc<ShellPoolConfig>,
    sessions: StdMutex<HashMap<EnvironmentKey, Arc<ShellSession>>>,
    next_session_id: AtomicU64,
}

impl PoolInner {
    /// Removes the entry only if it still belongs to the session that died.
    fn evict(&self, key: &EnvironmentKey, session_id: u64) {
        let mut sessions = lock(&self.sessions);
        if sessions
            .get(key)
            .is_some_and(|session| session.id() == session_id)
        {
            sessions.remove(key);
            debug!(session_id, remaining = sessions.len(), "evicted shell session");
        }
    }
}

impl Default for ShellPool {
    fn default() -> Self {
        Self::new(ShellPoolConfig::default())
    }
}

impl ShellPool {
    pub fn new(config: ShellPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config: Arc::new(config),
                sessions: StdMutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ShellPoolConfig {
        &self.inner.config
    }

    /// Runs `command` and decodes both streams. A nonzero exit is returned as
    /// [`ExecError::NonZeroExit`] carrying the code and the decoded streams.
    pub async fn exec(&self, command: &str, options: &ExecOptions) -> Result<ExecOutput> {
        let result = self.run(command, options).await?;
        let encoding = options.encoding();
        let stdout = encoding.decode(result.stdout);
        let stderr = encoding.decode(result.stderr);
        if result.exit_code != 0 {
            return Err(ExecError::NonZeroExit {
                code: result.exit_code,
                stdout,
                stderr,
            });
        }
        Ok(ExecOutput { stdout, stderr })
    }

    /// Runs `command` and returns the raw record; the exit code is data.
    pub async fn run(&self, command: &str, options: &ExecOptions) -> Result<CommandResult> {
        let request = CommandRequest::from_options(command, options)?;
        let session = self.session(&self.key_for(options))?;
        session.exec(&request).await
    }

    /// Environment identity `options` resolve to: `env_pairs` verbatim, else
    /// the canonicalized `env`, else the host environment.
    pub fn key_for(&self, options: &ExecOptions) -> EnvironmentKey {
        if let Some(pairs) = &options.env_pairs {
            return EnvironmentKey::from_pairs(pairs.iter().cloned());
        }
        match &options.env {
            Some(env) => self.canonicalize(env),
            None => EnvironmentKey::from_host(),
        }
    }

    /// Live session for `key`, spawning one if there is none. Lookup, spawn
    /// and insertion happen under one lock, so two live sessions never
    /// coexist for the same key.
    pub fn session(&self, key: &EnvironmentKey) -> Result<Arc<ShellSession>> {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(session) = sessions.get(key).filter(|session| !session.is_dead()) {
            return Ok(Arc::clone(session));
        }

        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = ShellSession::spawn(
            session_id,
            key.clone(),
            Arc::clone(&self.inner.config),
            eviction_hook(Arc::downgrade(&self.inner), key.clone(), session_id),
        )?;
        if let Some(previous) = sessions.insert(key.clone(), Arc::clone(&session)) {
            debug!(
                session_id,
                replaced = previous.id(),
                "replaced dead shell session"
            );
        }
        Ok(session)
    }

    /// Process id serving `env` (`None` meaning the host environment), if a
    /// live session exists. Never spawns.
    pub fn pid(&self, env: Option<&HashMap<String, Option<String>>>) -> Option<u32> {
        let key = match env {
            Some(env) => self.canonicalize(env),
            None => EnvironmentKey::from_host(),
        };
        self.pid_for_key(&key)
    }

    pub fn pid_for_pairs<I, S>(&self, pairs: I) -> Option<u32>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pid_for_key(&EnvironmentKey::from_pairs(pairs))
    }

    pub fn pid_for_key(&self, key: &EnvironmentKey) -> Option<u32> {
        lock(&self.inner.sessions)
            .get(key)
            .filter(|session| !session.is_dead())
            .map(|session| session.pid())
    }

    /// Closes every session one after another. Concurrent callers each drain
    /// their own snapshot; all of them return once their sessions are gone.
    pub async fn close(&self) {
        let sessions: Vec<Arc<ShellSession>> = {
            let mut sessions = lock(&self.inner.sessions);
            sessions.drain().map(|(_, session)| session).collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "closing shell sessions");
        for session in sessions {
            session.close().await;
        }
    }

    /// Number of sessions currently registered.
    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.sessions).is_empty()
    }

    fn canonicalize(&self, env: &HashMap<String, Option<String>>) -> EnvironmentKey {
        EnvironmentKey::canonicalize(
            env.iter().map(|(name, value)| (name, value.as_ref())),
            self.inner.config.coverage_var(),
        )
    }
}

impl std::fmt::Debug for ShellPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellPool")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

fn eviction_hook(
    pool: Weak<PoolInner>,
    key: EnvironmentKey,
    session_id: u64,
) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        if let Some(pool) = pool.upgrade() {
            pool.evict(&key, session_id);
        }
    })
}

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
