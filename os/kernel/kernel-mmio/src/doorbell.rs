use crate::RegisterIo;
use alloc::sync::Arc;
use core::fmt;

/// A single doorbell register: a write-only 32-bit slot that tells the device
/// a queue index moved.
///
/// The write goes through [`RegisterIo::write_u32`], so every queue entry the
/// driver wrote before ringing is visible to the device first.
#[derive(Clone)]
pub struct Doorbell {
    regs: Arc<dyn RegisterIo>,
    offset: usize,
}

impl Doorbell {
    #[must_use]
    pub fn new(regs: Arc<dyn RegisterIo>, offset: usize) -> Self {
        Self { regs, offset }
    }

    #[inline]
    pub fn ring(&self, value: u32) {
        self.regs.write_u32(self.offset, value);
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Doorbell({:#x})", self.offset)
    }
}
