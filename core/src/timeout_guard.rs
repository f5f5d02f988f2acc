use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Sleep;
use tokio::time::sleep;

/// Deadline for one in-flight command. A zero timeout never fires. The timer
/// is cleared when the guard is dropped.
#[derive(Debug)]
pub(crate) struct TimeoutGuard {
    timeout: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl TimeoutGuard {
    pub(crate) fn arm(timeout: Duration) -> Self {
        let sleep = (!timeout.is_zero()).then(|| Box::pin(sleep(timeout)));
        Self { timeout, sleep }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves once the deadline passes; pends forever when unarmed.
    pub(crate) async fn expired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => pending::<()>().await,
        }
    }
}
