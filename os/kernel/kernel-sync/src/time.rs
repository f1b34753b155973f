use core::fmt;
use core::time::Duration;

/// Monotonic time source in nanoseconds.
///
/// The kernel backs this with the calibrated TSC; hosted tests use
/// `std::time::Instant`.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// A point in time after which a bounded wait gives up.
///
/// [`Deadline::never`] needs no clock and never expires, which is what
/// steady-state I/O submission uses by default.
#[derive(Clone, Copy)]
pub struct Deadline<'c> {
    at: Option<(&'c dyn Clock, u64)>,
}

impl<'c> Deadline<'c> {
    #[must_use]
    pub const fn never() -> Self {
        Self { at: None }
    }

    /// Expires once `clock` reads `at_ns` or later.
    #[must_use]
    pub fn at(clock: &'c dyn Clock, at_ns: u64) -> Self {
        Self {
            at: Some((clock, at_ns)),
        }
    }

    #[must_use]
    pub fn after(clock: &'c dyn Clock, timeout: Duration) -> Self {
        let now = clock.now_ns();
        let delta = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        Self::at(clock, now.saturating_add(delta))
    }

    #[must_use]
    pub fn after_ms(clock: &'c dyn Clock, millis: u64) -> Self {
        Self::after(clock, Duration::from_millis(millis))
    }

    #[inline]
    #[must_use]
    pub fn has_expired(&self) -> bool {
        match self.at {
            None => false,
            Some((clock, at_ns)) => clock.now_ns() >= at_ns,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_never(&self) -> bool {
        self.at.is_none()
    }
}

impl fmt::Debug for Deadline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.at {
            None => f.write_str("Deadline(never)"),
            Some((_, at_ns)) => write!(f, "Deadline(at {at_ns} ns)"),
        }
    }
}
