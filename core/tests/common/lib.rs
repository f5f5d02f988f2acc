use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use shellpool_core::ShellPool;
use shellpool_core::ShellPoolConfig;
use tempfile::TempDir;
use tokio::time::Instant;

const WAIT_LIMIT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A pool whose staging directories live in a private temp dir, so tests can
/// inspect and clean up after it.
pub struct TestPool {
    pool: ShellPool,
    staging: TempDir,
}

impl TestPool {
    pub fn new() -> Self {
        Self::with_config(ShellPoolConfig::default())
    }

    pub fn with_config(mut config: ShellPoolConfig) -> Self {
        let staging = tempfile::tempdir().unwrap_or_else(|err| panic!("staging tempdir: {err}"));
        config.temp_dir = Some(staging.path().to_path_buf());
        config.close_grace_ms = 500;
        Self {
            pool: ShellPool::new(config),
            staging,
        }
    }

    pub fn pool(&self) -> &ShellPool {
        &self.pool
    }

    pub fn staging_root(&self) -> &Path {
        self.staging.path()
    }

    /// Per-session staging directories currently on disk.
    pub fn staging_dirs(&self) -> Vec<PathBuf> {
        let entries = std::fs::read_dir(self.staging.path())
            .unwrap_or_else(|err| panic!("read staging root: {err}"));
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        dirs.sort();
        dirs
    }
}

impl Default for TestPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestPool {
    type Target = ShellPool;

    fn deref(&self) -> &ShellPool {
        &self.pool
    }
}

/// Builds an `env` option map where every entry has a value.
pub fn env(vars: &[(&str, &str)]) -> HashMap<String, Option<String>> {
    vars.iter()
        .map(|(name, value)| ((*name).to_string(), Some((*value).to_string())))
        .collect()
}

/// Polls `condition` until it holds, panicking after a generous limit.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Whether a process with `pid` is still running. Zombies count as gone: an
/// orphan may wait a while for its new parent to reap it.
pub fn process_exists(pid: u32) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        return match stat.rsplit_once(')') {
            Some((_, rest)) => !matches!(rest.trim_start().chars().next(), Some('Z' | 'X')),
            None => true,
        };
    }
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Sends `signal` (a name such as `TERM` or `KILL`) to `pid`.
pub fn send_signal(pid: u32, signal: &str) {
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -s {signal} {pid}"))
        .status()
        .unwrap_or_else(|err| panic!("run kill: {err}"));
    assert!(status.success(), "kill -s {signal} {pid} failed");
}
