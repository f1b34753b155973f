//! What the driver needs from the rest of the kernel.
//!
//! PCI enumeration, interrupt vector allocation, physical memory management
//! and page tables live outside this crate. A controller is handed its
//! [`ControllerResources`] (an already mapped BAR0 and an allocated interrupt
//! range) and an implementation of [`Platform`] for everything else.

use crate::wire::PAGE_SIZE;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use kernel_mmio::RegisterIo;
use kernel_sync::Clock;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A physical (bus) address as seen by the device.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Offset of the address within its 4 KiB page.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_offset(self) -> usize {
        (self.0 as usize) & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// A physically contiguous run of bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysRange {
    pub addr: PhysAddr,
    pub len: usize,
}

/// Contiguous, device-visible memory, mapped uncached or coherent.
///
/// Regions are plain handles; they are returned to the platform with
/// [`Platform::free_dma`].
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
}

// SAFETY: the region is a handle to memory shared with a device; all access
// goes through volatile reads and writes or happens during single-threaded
// bring-up.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// # Safety
    /// `virt` must map `len` bytes of physically contiguous memory starting
    /// at `phys`, page aligned, valid until the region is freed.
    #[must_use]
    pub const unsafe fn new(virt: NonNull<u8>, phys: PhysAddr, len: usize) -> Self {
        Self { virt, phys, len }
    }

    #[must_use]
    pub const fn as_ptr(&self) -> NonNull<u8> {
        self.virt
    }

    #[must_use]
    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn zero(&self) {
        // SAFETY: the whole region is mapped per `new`.
        unsafe { core::ptr::write_bytes(self.virt.as_ptr(), 0, self.len) }
    }

    /// Copies `value` into the region at `offset`.
    ///
    /// # Panics
    /// If the value does not fit.
    pub fn write<T: IntoBytes + Immutable>(&self, offset: usize, value: &T) {
        let bytes = value.as_bytes();
        assert!(offset + bytes.len() <= self.len, "DMA write past region end");
        // SAFETY: bounds checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.virt.as_ptr().add(offset), bytes.len());
        }
    }

    /// Copies a `T` out of the region at `offset`.
    ///
    /// # Panics
    /// If the value does not fit.
    #[must_use]
    pub fn read<T: FromBytes>(&self, offset: usize) -> T {
        assert!(offset + size_of::<T>() <= self.len, "DMA read past region end");
        // SAFETY: bounds checked above; T is valid for any bit pattern.
        unsafe { self.virt.as_ptr().add(offset).cast::<T>().read_unaligned() }
    }

    /// Borrows the start of the region as a `T`, without copying.
    ///
    /// Only sound to hold while the device is not writing the region.
    #[must_use]
    pub fn view<T: FromBytes + KnownLayout + Immutable>(&self) -> Option<&T> {
        // SAFETY: the whole region is mapped per `new`.
        let bytes = unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) };
        T::ref_from_prefix(bytes).ok().map(|(value, _)| value)
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("virt", &self.virt)
            .field("phys", &self.phys)
            .field("len", &self.len)
            .finish()
    }
}

/// Kernel services consumed by the driver.
///
/// The [`Clock`] supertrait provides the time base for every bring-up and
/// submission deadline.
pub trait Platform: Clock {
    /// Allocates `len` bytes of zeroed, page-aligned, physically contiguous
    /// memory, or `None` if no such block is available.
    fn alloc_dma(&self, len: usize) -> Option<DmaRegion>;

    fn free_dma(&self, region: DmaRegion);

    /// Translates a kernel virtual address.
    fn phys_addr(&self, virt: *const u8) -> Option<PhysAddr>;

    /// Appends the page-bounded physical ranges backing `virt..virt + len` to
    /// `out`, stopping after `max_ranges` ranges, and returns the number of
    /// bytes covered.
    ///
    /// Every range but the first starts on a page boundary and every range
    /// but the last ends on one, which is exactly the shape a PRP list can
    /// describe.
    fn phys_ranges(&self, virt: *const u8, len: usize, max_ranges: usize, out: &mut Vec<PhysRange>) -> usize {
        let mut covered = 0;
        let mut taken = 0;
        while covered < len && taken < max_ranges {
            let at = virt.wrapping_add(covered);
            let Some(addr) = self.phys_addr(at) else {
                break;
            };
            let in_page = (PAGE_SIZE - addr.page_offset()).min(len - covered);
            out.push(PhysRange { addr, len: in_page });
            covered += in_page;
            taken += 1;
        }
        covered
    }

    fn current_cpu(&self) -> usize;

    fn cpu_count(&self) -> usize;
}

/// How the controller's interrupts are delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqMode {
    MsiX,
    Msi,
    /// Legacy INTx; one shared line for every queue.
    Pin,
}

/// The interrupt vectors allocated to one controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IrqRange {
    pub base: u32,
    pub count: u32,
    pub mode: IrqMode,
}

impl IrqRange {
    /// Offset of `vector` within the range, if it belongs to it.
    #[must_use]
    pub const fn offset_of(&self, vector: u32) -> Option<u32> {
        if vector >= self.base && vector - self.base < self.count {
            Some(vector - self.base)
        } else {
            None
        }
    }

    /// Vector offset a queue signals: the admin queue uses vector 0 and I/O
    /// queues share the rest round robin. With a single vector everything
    /// signals vector 0.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn vector_for_queue(&self, qid: u16) -> u16 {
        if qid == 0 || self.count <= 1 || matches!(self.mode, IrqMode::Pin) {
            0
        } else {
            (1 + (qid as u32 - 1) % (self.count - 1)) as u16
        }
    }
}

/// Per-controller resources discovered and mapped by the PCI layer.
#[derive(Clone)]
pub struct ControllerResources {
    /// BAR0, mapped uncached.
    pub registers: Arc<dyn RegisterIo>,
    pub irq: IrqRange,
}

impl fmt::Debug for ControllerResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerResources")
            .field("irq", &self.irq)
            .finish_non_exhaustive()
    }
}
