use crate::RegisterIo;
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};

/// A mapped MMIO window (uncached, physically backed by device registers).
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region only hands out volatile accesses; the device registers
// themselves are the shared state and are designed for concurrent access.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// # Safety
    /// - `base` must point to `len` bytes of mapped, uncached MMIO (or plain
    ///   memory, in tests) that stays mapped for the lifetime of the region.
    /// - `base` must be at least 8-byte aligned.
    ///
    /// # Panics
    /// If `base` is null.
    #[must_use]
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        let base = NonNull::new(base).expect("MMIO base must not be null");
        debug_assert_eq!(base.as_ptr() as usize % 8, 0, "MMIO base must be 8-byte aligned");
        Self { base, len }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn ptr<T>(&self, offset: usize) -> *mut T {
        let width = size_of::<T>();
        assert!(
            offset.checked_add(width).is_some_and(|end| end <= self.len),
            "MMIO access at {offset:#x} (+{width}) outside window of {:#x} bytes",
            self.len
        );
        assert_eq!(offset % width, 0, "unaligned MMIO access at {offset:#x}");
        // SAFETY: bounds checked above; the window is mapped per `new`.
        unsafe { self.base.as_ptr().add(offset).cast::<T>() }
    }
}

impl RegisterIo for MmioRegion {
    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        let v = unsafe { self.ptr::<u32>(offset).read_volatile() };
        fence(Ordering::Acquire);
        v
    }

    #[inline]
    fn write_u32(&self, offset: usize, value: u32) {
        fence(Ordering::Release);
        unsafe { self.ptr::<u32>(offset).write_volatile(value) }
    }

    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        let v = unsafe { self.ptr::<u64>(offset).read_volatile() };
        fence(Ordering::Acquire);
        v
    }

    #[inline]
    fn write_u64(&self, offset: usize, value: u64) {
        fence(Ordering::Release);
        unsafe { self.ptr::<u64>(offset).write_volatile(value) }
    }
}
