//! Fixed-capacity rings shared with the controller.
//!
//! A [`Ring`] is one half of a queue pair: an array of wire-format entries in
//! DMA memory plus the software copy of its indices. The producer owns the
//! tail and the consumer owns the head; whichever index this side owns is
//! published to the device through the ring's doorbell.
//!
//! One slot always stays empty, so `head == tail` means empty and
//! `tail + 1 == head` (mod capacity) means full. Each index carries a phase
//! bit that flips every time the index wraps to zero; the controller stamps
//! completion entries with its current phase, which lets the consumer tell
//! fresh entries from stale ones without clearing memory.

use core::fmt;
use core::ptr::NonNull;
use kernel_mmio::Doorbell;

/// Which index of the ring the doorbell publishes.
#[derive(Debug, Clone)]
pub enum RingDoorbell {
    /// Submission rings: the driver produces, the doorbell carries the tail.
    Tail(Doorbell),
    /// Completion rings: the driver consumes, the doorbell carries the head.
    Head(Doorbell),
}

pub struct Ring<T> {
    entries: NonNull<T>,
    mask: u32,
    head: u32,
    tail: u32,
    head_phase: bool,
    tail_phase: bool,
    doorbell: Option<RingDoorbell>,
}

// SAFETY: the ring exclusively owns its entry array; concurrent access is
// serialized by the queue pair lock.
unsafe impl<T: Send> Send for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// # Safety
    /// `entries` must point to `capacity` entries of DMA memory that stay
    /// valid for the lifetime of the ring and are not accessed through any
    /// other ring.
    ///
    /// # Panics
    /// If `capacity` is not a power of two of at least 2, or exceeds 65536.
    #[must_use]
    pub unsafe fn new(entries: NonNull<T>, capacity: u32, doorbell: Option<RingDoorbell>) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two() && capacity <= 0x1_0000,
            "invalid ring capacity {capacity}"
        );
        Self {
            entries,
            mask: capacity - 1,
            head: 0,
            tail: 0,
            head_phase: true,
            tail_phase: true,
            doorbell,
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.mask + 1
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn head(&self) -> u16 {
        self.head as u16
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn tail(&self) -> u16 {
        self.tail as u16
    }

    #[must_use]
    pub const fn head_phase(&self) -> bool {
        self.head_phase
    }

    #[must_use]
    pub const fn tail_phase(&self) -> bool {
        self.tail_phase
    }

    /// Entries produced but not yet consumed.
    #[inline]
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.tail.wrapping_sub(self.head) & self.mask
    }

    /// Entries that can still be enqueued.
    #[inline]
    #[must_use]
    pub const fn space(&self) -> u32 {
        self.mask - self.count()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        ((self.tail + 1) & self.mask) == self.head
    }

    /// Writes `item` at the tail and publishes the new tail.
    ///
    /// Returns the slot the item was written to.
    ///
    /// # Panics
    /// If the ring is full.
    pub fn enqueue(&mut self, item: T) -> u16 {
        assert!(!self.is_full(), "enqueue on a full ring");
        let slot = self.tail();
        // SAFETY: tail <= mask < capacity.
        unsafe { self.entries.add(self.tail as usize).write_volatile(item) };

        self.tail = (self.tail + 1) & self.mask;
        if self.tail == 0 {
            self.tail_phase = !self.tail_phase;
        }
        if let Some(RingDoorbell::Tail(doorbell)) = &self.doorbell {
            doorbell.ring(self.tail);
        }
        slot
    }

    /// Reads the entry `offset` slots past the head without consuming it,
    /// together with the phase a fresh entry at that slot carries.
    ///
    /// # Panics
    /// If `offset` is not smaller than the capacity.
    #[must_use]
    pub fn peek_at_head(&self, offset: u32) -> (T, bool) {
        assert!(offset <= self.mask, "peek beyond ring capacity");
        let index = (self.head + offset) & self.mask;
        let expected_phase = self.head_phase ^ (index < self.head);
        // SAFETY: index <= mask < capacity.
        let item = unsafe { self.entries.add(index as usize).read_volatile() };
        (item, expected_phase)
    }

    /// Moves the head to `new_head`, e.g. after the device reported how far it
    /// consumed a submission ring. Moving backwards counts as a wrap.
    ///
    /// # Panics
    /// If `new_head` is outside the ring.
    pub fn advance_head_to(&mut self, new_head: u16) {
        let new_head = u32::from(new_head);
        assert!(new_head <= self.mask, "head {new_head} outside ring of {}", self.capacity());
        if new_head == self.head {
            return;
        }
        if new_head < self.head {
            self.head_phase = !self.head_phase;
        }
        self.head = new_head;
        if let Some(RingDoorbell::Head(doorbell)) = &self.doorbell {
            doorbell.ring(self.head);
        }
    }

    /// Consumes `n` entries at the head.
    #[allow(clippy::cast_possible_truncation)]
    pub fn take(&mut self, n: u32) {
        debug_assert!(n <= self.mask, "take({n}) beyond ring capacity");
        self.advance_head_to(((self.head + n) & self.mask) as u16);
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &(self.mask + 1))
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("head_phase", &self.head_phase)
            .field("tail_phase", &self.tail_phase)
            .finish_non_exhaustive()
    }
}
