//! Interrupt masking for critical sections shared with interrupt handlers.
//!
//! On bare metal (`target_os = "none"`) the guard executes `cli` and restores
//! the previous `IF` state on drop. Hosted builds (unit tests, tools) have no
//! privileged interrupt flag to touch, so the guard only records that it was
//! taken.

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[cfg(target_os = "none")]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted.
#[cfg(target_os = "none")]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns whether maskable interrupts are currently enabled (`RFLAGS.IF`).
#[cfg(target_os = "none")]
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    (r & (1 << 9)) != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled it
/// executes `cli`; on drop it executes `sti` **only** if they were enabled
/// before, so guards nest.
///
/// ```
/// use kernel_sync::IrqGuard;
///
/// {
///     let _outer = IrqGuard::new();
///     let _inner = IrqGuard::new(); // nested: restores nothing on drop
/// }
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    #[cfg(target_os = "none")]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    #[inline]
    #[must_use]
    #[cfg(not(target_os = "none"))]
    pub const fn new() -> Self {
        Self {
            were_enabled: false,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "none")]
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
