use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::MutexGuard;

/// Serializes the write/read cycle of commands sent to one shell.
///
/// Waiters are served strictly in the order they started waiting. The guard
/// releases on drop, so an error, a timeout or a cancelled future all hand
/// the lock to the next waiter.
#[derive(Debug)]
pub(crate) struct CommandLock<T> {
    inner: Mutex<T>,
    waiting: AtomicUsize,
}

#[derive(Debug)]
pub(crate) struct CommandGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> CommandLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            waiting: AtomicUsize::new(0),
        }
    }

    pub(crate) async fn acquire(&self) -> CommandGuard<'_, T> {
        let _waiting = WaitingSlot::enter(&self.waiting);
        let guard = self.inner.lock().await;
        CommandGuard { guard }
    }

    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> Option<CommandGuard<'_, T>> {
        self.inner
            .try_lock()
            .ok()
            .map(|guard| CommandGuard { guard })
    }

    /// Number of callers currently queued behind the holder.
    pub(crate) fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl<T> Deref for CommandGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CommandGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Keeps the waiter count honest when an `acquire` future is dropped early.
struct WaitingSlot<'a>(&'a AtomicUsize);

impl<'a> WaitingSlot<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
