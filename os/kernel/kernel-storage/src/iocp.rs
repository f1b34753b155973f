//! I/O completion ports.
//!
//! An [`Iocp`] aggregates the completions of every hardware command a request
//! was split into. The producer (a driver's request splitter) announces how
//! many completions to expect with [`Iocp::set_expect`]; each command's
//! completion handler then calls [`Iocp::complete`]. When the last expected
//! completion arrives, the port *fires*: it either wakes threads blocked in
//! [`Iocp::wait`] or runs its continuation.
//!
//! The first error reported wins; later errors and successes do not
//! overwrite it.
//!
//! ```
//! use kernel_storage::{Iocp, IoError};
//!
//! let iocp = Iocp::blocking();
//! iocp.set_expect(2);
//! iocp.complete(Err(IoError::TimedOut));
//! assert!(!iocp.is_done());
//! iocp.complete(Ok(()));
//! assert_eq!(iocp.wait(), Err(IoError::TimedOut));
//! ```

use crate::{IoError, IoResult};
use alloc::boxed::Box;
use core::fmt;
use kernel_sync::{Deadline, SpinLock, WaitCondition};

type Continuation = Box<dyn FnMut(IoResult) + Send>;

enum Action {
    Wake,
    /// `None` while the continuation is running.
    Continue(Option<Continuation>),
}

struct State {
    expected: u32,
    completed: u32,
    result: IoResult,
    fired: bool,
    /// Set when the port fires again while its continuation is running.
    refire: bool,
    action: Action,
}

impl State {
    const fn new(action: Action) -> Self {
        Self {
            expected: 0,
            completed: 0,
            result: Ok(()),
            fired: false,
            refire: false,
            action,
        }
    }

    const fn should_fire(&self) -> bool {
        !self.fired && self.expected > 0 && self.completed >= self.expected
    }
}

pub struct Iocp {
    state: SpinLock<State>,
    done: WaitCondition,
}

impl Iocp {
    /// A port whose owner waits for it with [`wait`](Self::wait).
    #[must_use]
    pub const fn blocking() -> Self {
        Self {
            state: SpinLock::new(State::new(Action::Wake)),
            done: WaitCondition::new(),
        }
    }

    /// A port that calls `continuation` with the aggregated result when it
    /// fires. The continuation runs on whichever thread delivered the last
    /// completion, typically in interrupt context, so it must not block.
    ///
    /// The continuation may re-arm its own port. If the port fires again
    /// while the continuation runs, it is called again once it returns.
    #[must_use]
    pub fn with_continuation(continuation: impl FnMut(IoResult) + Send + 'static) -> Self {
        Self {
            state: SpinLock::new(State::new(Action::Continue(Some(Box::new(continuation))))),
            done: WaitCondition::new(),
        }
    }

    /// Arms the port for `expected` completions.
    ///
    /// Must be called before the first completion can arrive. Completions
    /// that were delivered before arming still count.
    pub fn set_expect(&self, expected: u32) {
        let mut state = self.state.lock_irq();
        debug_assert_eq!(state.expected, 0, "Iocp armed twice without reset");
        debug_assert!(
            state.completed <= expected,
            "{} completions already delivered, only {expected} expected",
            state.completed
        );
        state.expected = expected;
        self.fire_if_done(state);
    }

    /// Records `result` without counting a completion.
    pub fn set_result(&self, result: IoResult) {
        let mut state = self.state.lock_irq();
        Self::record(&mut state, result);
    }

    /// Counts one completion.
    pub fn invoke(&self) {
        let mut state = self.state.lock_irq();
        Self::count(&mut state);
        self.fire_if_done(state);
    }

    /// [`set_result`](Self::set_result) followed by [`invoke`](Self::invoke),
    /// atomically.
    pub fn complete(&self, result: IoResult) {
        let mut state = self.state.lock_irq();
        Self::record(&mut state, result);
        Self::count(&mut state);
        self.fire_if_done(state);
    }

    /// Blocks until the port fires and returns the aggregated result.
    pub fn wait(&self) -> IoResult {
        self.wait_until(&Deadline::never())
    }

    /// Like [`wait`](Self::wait), giving up at `deadline`.
    ///
    /// # Errors
    /// The aggregated result, or [`IoError::TimedOut`] if the deadline passed
    /// first. In-flight commands are not cancelled by a timeout.
    pub fn wait_until(&self, deadline: &Deadline<'_>) -> IoResult {
        let mut state = self.state.lock_irq();
        self.done
            .wait_while(&mut state, deadline, |s| !s.fired)
            .map_err(|_| IoError::TimedOut)?;
        state.result
    }

    /// The result recorded so far.
    #[must_use]
    pub fn result(&self) -> IoResult {
        self.state.lock_irq().result
    }

    #[must_use]
    pub fn expected(&self) -> u32 {
        self.state.lock_irq().expected
    }

    #[must_use]
    pub fn completed(&self) -> u32 {
        self.state.lock_irq().completed
    }

    /// Whether the port has fired.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock_irq().fired
    }

    /// Re-arms a fired (or never used) port for another request.
    ///
    /// # Panics
    /// In debug builds, if completions are still outstanding.
    pub fn reset(&self) {
        let mut state = self.state.lock_irq();
        debug_assert!(
            state.expected == 0 || state.fired,
            "reset with {}/{} completions outstanding",
            state.completed,
            state.expected
        );
        state.expected = 0;
        state.completed = 0;
        state.result = Ok(());
        state.fired = false;
    }

    fn record(state: &mut State, result: IoResult) {
        if state.result.is_ok() {
            state.result = result;
        }
    }

    fn count(state: &mut State) {
        state.completed += 1;
        debug_assert!(
            state.expected == 0 || state.completed <= state.expected,
            "Iocp completed {} times, expected {}",
            state.completed,
            state.expected
        );
    }

    fn fire_if_done(&self, mut state: kernel_sync::SpinLockGuard<'_, State>) {
        if !state.should_fire() {
            return;
        }
        state.fired = true;
        self.done.notify_all();

        let mut continuation = match &mut state.action {
            Action::Wake => return,
            Action::Continue(slot) => match slot.take() {
                Some(continuation) => continuation,
                // Running further up the stack or on another CPU; whoever
                // holds it runs it again for this firing.
                None => {
                    state.refire = true;
                    return;
                }
            },
        };
        let mut result = state.result;
        drop(state);

        loop {
            continuation(result);
            let mut state = self.state.lock_irq();
            if core::mem::take(&mut state.refire) {
                result = state.result;
                continue;
            }
            if let Action::Continue(slot) = &mut state.action {
                *slot = Some(continuation);
            }
            break;
        }
    }
}

impl Default for Iocp {
    fn default() -> Self {
        Self::blocking()
    }
}

impl fmt::Debug for Iocp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock_irq();
        f.debug_struct("Iocp")
            .field("expected", &state.expected)
            .field("completed", &state.completed)
            .field("result", &state.result)
            .field("fired", &state.fired)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fires_only_when_all_expected_completions_arrive() {
        let iocp = Iocp::blocking();
        iocp.set_expect(3);
        iocp.complete(Ok(()));
        iocp.complete(Ok(()));
        assert!(!iocp.is_done());
        assert_eq!(iocp.completed(), 2);
        iocp.complete(Ok(()));
        assert!(iocp.is_done());
        assert_eq!(iocp.wait(), Ok(()));
    }

    #[test]
    fn completions_before_arming_are_counted() {
        let iocp = Iocp::blocking();
        iocp.complete(Ok(()));
        assert!(!iocp.is_done(), "unarmed port never fires");
        iocp.set_expect(1);
        assert!(iocp.is_done());
    }

    #[test]
    fn first_error_wins() {
        let iocp = Iocp::blocking();
        iocp.set_expect(3);
        iocp.complete(Ok(()));
        iocp.complete(Err(IoError::Device {
            status_type: 0,
            status_code: 0x80,
        }));
        iocp.complete(Err(IoError::TimedOut));
        assert_eq!(
            iocp.result(),
            Err(IoError::Device {
                status_type: 0,
                status_code: 0x80
            })
        );
    }

    #[test]
    fn set_result_and_invoke_compose_like_complete() {
        let iocp = Iocp::blocking();
        iocp.set_expect(1);
        iocp.set_result(Err(IoError::NotReady));
        assert!(!iocp.is_done());
        iocp.invoke();
        assert_eq!(iocp.wait(), Err(IoError::NotReady));
    }

    #[test]
    fn continuation_runs_once_per_arming_and_survives_reset() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let iocp = Iocp::with_continuation(move |result| {
            assert_eq!(result, Ok(()));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        iocp.set_expect(2);
        iocp.complete(Ok(()));
        iocp.complete(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        iocp.reset();
        assert_eq!(iocp.expected(), 0);
        iocp.set_expect(1);
        iocp.complete(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn continuation_may_inspect_its_own_port() {
        let slot: Arc<std::sync::OnceLock<Arc<Iocp>>> = Arc::default();
        let inner = Arc::clone(&slot);
        let iocp = Arc::new(Iocp::with_continuation(move |_| {
            // Would deadlock if the continuation ran under the state lock.
            let port = inner.get().expect("port published");
            assert!(port.is_done());
        }));
        slot.set(Arc::clone(&iocp)).ok();

        iocp.set_expect(1);
        iocp.complete(Ok(()));
    }

    #[test]
    fn continuation_may_rearm_and_complete_its_own_port() {
        let calls = Arc::new(AtomicU32::new(0));
        let slot: Arc<std::sync::OnceLock<Arc<Iocp>>> = Arc::default();
        let (seen, inner) = (Arc::clone(&calls), Arc::clone(&slot));
        let iocp = Arc::new(Iocp::with_continuation(move |result| {
            match seen.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    assert_eq!(result, Ok(()));
                    let port = inner.get().expect("port published");
                    port.reset();
                    port.set_expect(1);
                    port.complete(Err(IoError::NotReady));
                }
                1 => assert_eq!(result, Err(IoError::NotReady)),
                _ => assert_eq!(result, Ok(())),
            }
        }));
        slot.set(Arc::clone(&iocp)).ok();

        iocp.set_expect(1);
        iocp.complete(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(iocp.is_done());
        assert_eq!(iocp.result(), Err(IoError::NotReady));

        // The continuation is back in its slot for the next arming.
        iocp.reset();
        iocp.set_expect(1);
        iocp.complete(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    #[should_panic(expected = "expected 1")]
    #[cfg(debug_assertions)]
    fn extra_completions_are_a_bug() {
        let iocp = Iocp::blocking();
        iocp.set_expect(1);
        iocp.complete(Ok(()));
        iocp.complete(Ok(()));
    }
}
