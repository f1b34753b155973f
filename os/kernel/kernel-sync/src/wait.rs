use crate::{Deadline, SpinLockGuard};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// A bounded wait failed because its [`Deadline`] passed first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("wait timed out")]
pub struct WaitTimedOut;

/// Condition variable for [`SpinLock`](crate::SpinLock)-protected state.
///
/// Waiters drop the lock and spin until either the generation counter moves
/// (someone called [`notify_all`](Self::notify_all)) or their deadline
/// passes, then re-acquire and re-check their condition.
///
/// Notifiers must change the guarded state *while holding the lock* and call
/// `notify_all` before releasing it; otherwise a waiter may sample the
/// generation after the change and sleep through it until its deadline.
pub struct WaitCondition {
    generation: AtomicU32,
}

impl Default for WaitCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitCondition {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Blocks while `condition` holds for the guarded value.
    ///
    /// Returns with the lock held in both cases.
    ///
    /// # Errors
    /// [`WaitTimedOut`] if `deadline` passed while `condition` still held.
    pub fn wait_while<T>(
        &self,
        guard: &mut SpinLockGuard<'_, T>,
        deadline: &Deadline<'_>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) -> Result<(), WaitTimedOut> {
        loop {
            if !condition(&mut **guard) {
                return Ok(());
            }
            if deadline.has_expired() {
                return Err(WaitTimedOut);
            }

            let seen = self.generation.load(Ordering::Acquire);
            SpinLockGuard::unlocked(guard, || {
                while self.generation.load(Ordering::Acquire) == seen && !deadline.has_expired() {
                    spin_loop();
                }
            });
        }
    }
}
