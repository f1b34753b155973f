//! # Typed memory-mapped I/O
//!
//! Device registers must never be touched with plain loads and stores: the
//! compiler may merge, reorder or elide them, and the CPU may let a doorbell
//! write overtake the descriptor writes it announces. This crate funnels every
//! access through [`RegisterIo`], whose implementations pair each volatile
//! access with an explicit fence:
//!
//! | Access | Ordering |
//! |--------|----------|
//! | read   | volatile load, then `Acquire` fence (later reads of DMA memory see what the device wrote before the register changed) |
//! | write  | `Release` fence, then volatile store (all prior DMA memory writes are visible before the device observes the register) |
//!
//! On top of the raw offset-based interface, registers are modelled as typed
//! values (usually [`bitfield_struct`](https://docs.rs/bitfield-struct)
//! structs) that know their own offset, see [`Register32`] / [`Register64`]
//! and the [`RegisterBlock`] extension trait:
//!
//! ```
//! use kernel_mmio::{MmioRegion, Register32, RegisterBlock};
//!
//! #[derive(Clone, Copy, Debug, PartialEq)]
//! struct Status(u32);
//! impl From<u32> for Status { fn from(v: u32) -> Self { Self(v) } }
//! impl From<Status> for u32 { fn from(v: Status) -> Self { v.0 } }
//! impl Register32 for Status { const OFFSET: usize = 0x4; }
//!
//! let mut backing = [0u32; 4];
//! let regs = unsafe { MmioRegion::new(backing.as_mut_ptr().cast(), 16) };
//! regs.store(Status(0x8000_0001));
//! assert_eq!(regs.load::<Status>(), Status(0x8000_0001));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod doorbell;
mod region;

pub use doorbell::Doorbell;
pub use region::MmioRegion;

/// Offset-addressed access to a device register window (e.g. a PCI BAR).
///
/// Offsets are in bytes from the start of the window and must be naturally
/// aligned for the access width. Out-of-range offsets are software bugs and
/// implementations may panic on them.
pub trait RegisterIo: Send + Sync {
    fn read_u32(&self, offset: usize) -> u32;

    fn write_u32(&self, offset: usize, value: u32);

    /// 64-bit read. The default splits into two 32-bit reads, low dword
    /// first, which is what devices without 64-bit MMIO support expect.
    fn read_u64(&self, offset: usize) -> u64 {
        let lo = self.read_u32(offset);
        let hi = self.read_u32(offset + 4);
        (u64::from(hi) << 32) | u64::from(lo)
    }

    /// 64-bit write, low dword first by default.
    #[allow(clippy::cast_possible_truncation)]
    fn write_u64(&self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }
}

/// A 32-bit register with a fixed offset in its register block.
pub trait Register32: Copy + From<u32> + Into<u32> {
    const OFFSET: usize;
}

/// A 64-bit register with a fixed offset in its register block.
pub trait Register64: Copy + From<u64> + Into<u64> {
    const OFFSET: usize;
}

/// Typed loads and stores on any [`RegisterIo`].
pub trait RegisterBlock {
    fn load<R: Register32>(&self) -> R;
    fn store<R: Register32>(&self, value: R);
    fn load64<R: Register64>(&self) -> R;
    fn store64<R: Register64>(&self, value: R);
}

impl<T> RegisterBlock for T
where
    T: RegisterIo + ?Sized,
{
    #[inline]
    fn load<R: Register32>(&self) -> R {
        R::from(self.read_u32(R::OFFSET))
    }

    #[inline]
    fn store<R: Register32>(&self, value: R) {
        self.write_u32(R::OFFSET, value.into());
    }

    #[inline]
    fn load64<R: Register64>(&self) -> R {
        R::from(self.read_u64(R::OFFSET))
    }

    #[inline]
    fn store64<R: Register64>(&self, value: R) {
        self.write_u64(R::OFFSET, value.into());
    }
}
