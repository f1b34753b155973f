//! Submission/completion queue pairs.
//!
//! A [`QueuePair`] ties a submission ring to a completion ring and tracks
//! which command is in flight in which slot. The command identifier of every
//! submitted command is its submission slot index, so the completion's `cid`
//! leads straight back to the handler registered at submission time.
//!
//! Besides the rings, each pair owns a scratch area of
//! [`SCRATCH_BYTES_PER_SLOT`] bytes per slot. Commands whose data spans more
//! than two pages put their PRP list there; Dataset Management commands put
//! their range descriptor there.

use crate::error::SubmitError;
use crate::platform::{PhysAddr, PhysRange};
use crate::queue::{Ring, RingDoorbell};
use crate::wire::{Command, Completion, DatasetRange, doorbell_offset};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use kernel_mmio::{Doorbell, RegisterIo};
use kernel_storage::{IoError, IoOwner, IoResult};
use kernel_sync::{Deadline, SpinLock, WaitCondition};
use log::{debug, trace, warn};

/// Scratch bytes reserved per submission slot.
pub const SCRATCH_BYTES_PER_SLOT: usize = 128;

/// PRP list entries that fit into one slot's scratch area.
pub const PRP_LIST_ENTRIES: usize = SCRATCH_BYTES_PER_SLOT / size_of::<u64>();

/// Physical ranges a single command can carry: one in PRP1, the rest in the
/// PRP list.
pub const MAX_PRP_RANGES: usize = 1 + PRP_LIST_ENTRIES;

/// Called once with the completion of the command it was submitted with.
pub type CompletionHandler = Box<dyn FnOnce(&CompletionEvent) + Send>;

/// A decoded completion as delivered to a [`CompletionHandler`].
#[derive(Debug, Copy, Clone)]
pub struct CompletionEvent {
    pub completion: Completion,
    pub command_id: u16,
    pub status_type: u8,
    pub status_code: u8,
}

impl CompletionEvent {
    #[must_use]
    pub const fn new(completion: Completion) -> Self {
        Self {
            completion,
            command_id: completion.cid,
            status_type: completion.status.sct(),
            status_code: completion.status.sc(),
        }
    }

    /// The completion status as an I/O result.
    ///
    /// # Errors
    /// [`IoError::Device`] for any status other than generic success.
    pub const fn result(&self) -> IoResult {
        if self.completion.is_success() {
            Ok(())
        } else {
            Err(IoError::Device {
                status_type: self.status_type,
                status_code: self.status_code,
            })
        }
    }
}

/// Data pointer contents of a submission.
#[derive(Debug, Copy, Clone)]
pub enum Payload<'a> {
    None,
    /// Page-bounded physical ranges of the data buffer, at most
    /// [`MAX_PRP_RANGES`].
    Ranges(&'a [PhysRange]),
    /// A single Dataset Management range, carried in the slot's scratch area.
    DatasetRange(DatasetRange),
}

enum HandlerSlot {
    Free,
    Pending {
        handler: CompletionHandler,
        owner: Option<IoOwner>,
    },
    /// The owner gave up on the command; the slot stays occupied until the
    /// device completes it.
    Cancelled,
}

impl HandlerSlot {
    const fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}

/// DMA memory backing one queue pair.
#[derive(Debug, Copy, Clone)]
pub struct QueueMemory {
    pub submission: NonNull<Command>,
    pub submission_phys: PhysAddr,
    pub completion: NonNull<Completion>,
    pub completion_phys: PhysAddr,
    /// `capacity * SCRATCH_BYTES_PER_SLOT` bytes, 128-byte aligned.
    pub scratch: NonNull<u8>,
    pub scratch_phys: PhysAddr,
}

/// A consumed completion whose follow-up work runs outside the lock.
type Drained = (Completion, Option<CompletionHandler>);

struct Inner {
    sq: Ring<Command>,
    cq: Ring<Completion>,
    handlers: Box<[HandlerSlot]>,
    scratch: NonNull<u8>,
    /// Lent to [`QueuePair::drain`] so the interrupt path does not allocate.
    batch: Vec<Drained>,
}

// SAFETY: the scratch pointer is only dereferenced under the queue pair lock.
unsafe impl Send for Inner {}

impl Inner {
    fn advance_submission_head(&mut self, qid: u16, sqhd: u16) {
        if u32::from(sqhd) < self.sq.capacity() {
            self.sq.advance_head_to(sqhd);
        } else {
            warn!("Queue {qid}: device reported SQ head {sqhd} outside the ring");
        }
    }

    fn take_handler(&mut self, qid: u16, cid: u16) -> Option<CompletionHandler> {
        let Some(slot) = self.handlers.get_mut(usize::from(cid)) else {
            warn!("Queue {qid}: completion for cid {cid} outside the ring");
            return None;
        };
        match mem::replace(slot, HandlerSlot::Free) {
            HandlerSlot::Pending { handler, .. } => Some(handler),
            HandlerSlot::Cancelled => {
                trace!("Queue {qid}: dropping completion of cancelled cid {cid}");
                None
            }
            HandlerSlot::Free => {
                warn!("Queue {qid}: spurious completion for idle cid {cid}");
                None
            }
        }
    }

    /// # Safety
    /// `slot` must be a valid slot of this pair.
    unsafe fn scratch_of(&self, slot: u16) -> *mut u8 {
        unsafe { self.scratch.as_ptr().add(usize::from(slot) * SCRATCH_BYTES_PER_SLOT) }
    }
}

pub struct QueuePair {
    id: u16,
    capacity: u32,
    submission_phys: PhysAddr,
    completion_phys: PhysAddr,
    scratch_phys: PhysAddr,
    inner: SpinLock<Inner>,
    not_full: WaitCondition,
}

impl QueuePair {
    /// # Safety
    /// `memory` must describe DMA memory of the sizes documented on
    /// [`QueueMemory`] for `capacity` entries, valid for the lifetime of the
    /// pair and used by nothing else.
    ///
    /// # Panics
    /// If `capacity` is not a power of two between 2 and 65536.
    #[must_use]
    pub unsafe fn new(
        id: u16,
        capacity: u32,
        memory: QueueMemory,
        registers: &Arc<dyn RegisterIo>,
        doorbell_stride: u8,
    ) -> Self {
        let sq_doorbell = Doorbell::new(Arc::clone(registers), doorbell_offset(id, false, doorbell_stride));
        let cq_doorbell = Doorbell::new(Arc::clone(registers), doorbell_offset(id, true, doorbell_stride));

        // SAFETY: forwarded from the caller.
        let (sq, cq) = unsafe {
            (
                Ring::new(memory.submission, capacity, Some(RingDoorbell::Tail(sq_doorbell))),
                Ring::new(memory.completion, capacity, Some(RingDoorbell::Head(cq_doorbell))),
            )
        };
        let handlers = (0..capacity).map(|_| HandlerSlot::Free).collect();

        Self {
            id,
            capacity,
            submission_phys: memory.submission_phys,
            completion_phys: memory.completion_phys,
            scratch_phys: memory.scratch_phys,
            inner: SpinLock::new(Inner {
                sq,
                cq,
                handlers,
                scratch: memory.scratch,
                batch: Vec::with_capacity(capacity as usize),
            }),
            not_full: WaitCondition::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub const fn submission_phys(&self) -> PhysAddr {
        self.submission_phys
    }

    #[must_use]
    pub const fn completion_phys(&self) -> PhysAddr {
        self.completion_phys
    }

    /// How far the device has consumed the submission ring.
    #[must_use]
    pub fn submission_head(&self) -> u16 {
        self.inner.lock_irq().sq.head()
    }

    /// Commands submitted but not yet completed, cancelled ones included.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .lock_irq()
            .handlers
            .iter()
            .filter(|slot| !slot.is_free())
            .count()
    }

    /// Queues `command` and registers `handler` for its completion.
    ///
    /// Waits until `deadline` while the submission ring is full or the next
    /// slot still belongs to an uncompleted command. Returns the command
    /// identifier.
    ///
    /// # Errors
    /// - [`SubmitError::TooManyRanges`] if the payload needs more than
    ///   [`MAX_PRP_RANGES`] ranges.
    /// - [`SubmitError::TimedOut`] if no slot became free in time.
    ///
    /// In both cases nothing was queued and `handler` is dropped uncalled.
    pub fn submit(
        &self,
        mut command: Command,
        handler: CompletionHandler,
        owner: Option<IoOwner>,
        deadline: &Deadline<'_>,
        payload: Payload<'_>,
    ) -> Result<u16, SubmitError> {
        if let Payload::Ranges(ranges) = payload
            && ranges.len() > MAX_PRP_RANGES
        {
            return Err(SubmitError::TooManyRanges { count: ranges.len() });
        }

        let mut inner = self.inner.lock_irq();
        self.not_full
            .wait_while(&mut inner, deadline, |inner| {
                inner.sq.is_full() || !inner.handlers[usize::from(inner.sq.tail())].is_free()
            })
            .map_err(|_| {
                debug!("Queue {}: no free submission slot before deadline", self.id);
                SubmitError::TimedOut
            })?;

        let slot = inner.sq.tail();
        command.cdw0.set_cid(slot);

        let scratch_phys = self.scratch_phys.offset(usize::from(slot) * SCRATCH_BYTES_PER_SLOT);
        match payload {
            Payload::None => {}
            Payload::Ranges(ranges) => {
                command.prp1 = ranges.first().map_or(0, |r| r.addr.as_u64());
                command.prp2 = match ranges {
                    [] | [_] => 0,
                    [_, second] => second.addr.as_u64(),
                    [_, rest @ ..] => {
                        // SAFETY: slot < capacity; the list fits the slot's scratch.
                        let list = unsafe { inner.scratch_of(slot) }.cast::<u64>();
                        for (i, range) in rest.iter().enumerate() {
                            unsafe { list.add(i).write_volatile(range.addr.as_u64()) };
                        }
                        scratch_phys.as_u64()
                    }
                };
            }
            Payload::DatasetRange(range) => {
                // SAFETY: slot < capacity; scratch slots are 128-byte aligned.
                unsafe { inner.scratch_of(slot).cast::<DatasetRange>().write_volatile(range) };
                command.prp1 = scratch_phys.as_u64();
                command.prp2 = 0;
            }
        }

        inner.handlers[usize::from(slot)] = HandlerSlot::Pending { handler, owner };
        inner.sq.enqueue(command);
        trace!(
            "Queue {}: submitted cid {slot} opcode {:#04x}",
            self.id,
            command.opcode()
        );
        Ok(slot)
    }

    /// Consumes every completion the device has posted and runs their
    /// handlers.
    ///
    /// `lookup` resolves submission queue ids other than this pair's own, so
    /// their heads can be advanced. Handlers and foreign head updates run
    /// after this pair's lock is released, so a handler may submit to any
    /// queue pair. Returns the number of completions consumed; zero for a
    /// spurious interrupt.
    pub fn drain<'q>(&self, lookup: impl Fn(u16) -> Option<&'q Self>) -> usize {
        let mut inner = self.inner.lock_irq();
        // Empty only while another drain of this pair holds the buffer.
        let mut batch = mem::take(&mut inner.batch);
        let limit = inner.cq.capacity() - 1;
        let mut consumed = 0;
        while consumed < limit {
            let (completion, phase) = inner.cq.peek_at_head(consumed);
            if completion.status.phase() != phase {
                break;
            }
            consumed += 1;

            if completion.sqid == self.id {
                inner.advance_submission_head(self.id, completion.sqhd);
            }
            let handler = inner.take_handler(self.id, completion.cid);
            if handler.is_some() || completion.sqid != self.id {
                batch.push((completion, handler));
            }
        }
        if consumed == 0 {
            inner.batch = batch;
            return 0;
        }
        inner.cq.take(consumed);
        self.not_full.notify_all();
        drop(inner);

        for (completion, _) in batch.iter().filter(|(c, _)| c.sqid != self.id) {
            match lookup(completion.sqid) {
                Some(pair) => pair.advance_submission_head(completion.sqhd),
                None => warn!("Queue {}: completion names unknown SQ {}", self.id, completion.sqid),
            }
        }

        for (completion, handler) in batch.drain(..) {
            let Some(handler) = handler else { continue };
            let event = CompletionEvent::new(completion);
            trace!(
                "Queue {}: cid {} done, status {:#x}/{:#04x}",
                self.id, event.command_id, event.status_type, event.status_code
            );
            handler(&event);
        }

        let mut inner = self.inner.lock_irq();
        if batch.capacity() > inner.batch.capacity() {
            mem::swap(&mut inner.batch, &mut batch);
        }
        drop(inner);
        consumed as usize
    }

    /// Applies a submission head reported on another pair's completion ring.
    pub fn advance_submission_head(&self, sqhd: u16) {
        let mut inner = self.inner.lock_irq();
        inner.advance_submission_head(self.id, sqhd);
        self.not_full.notify_all();
    }

    /// Drops the handlers of all commands submitted by `owner`.
    ///
    /// # Errors
    /// [`IoError::NotFound`] if `owner` had nothing in flight here.
    pub fn cancel(&self, owner: IoOwner) -> Result<usize, IoError> {
        let dropped: Vec<CompletionHandler> = {
            let mut inner = self.inner.lock_irq();
            inner
                .handlers
                .iter_mut()
                .filter(|slot| matches!(slot, HandlerSlot::Pending { owner: Some(o), .. } if *o == owner))
                .filter_map(|slot| match mem::replace(slot, HandlerSlot::Cancelled) {
                    HandlerSlot::Pending { handler, .. } => Some(handler),
                    _ => None,
                })
                .collect()
        };

        if dropped.is_empty() {
            return Err(IoError::NotFound);
        }
        debug!("Queue {}: cancelled {} commands", self.id, dropped.len());
        Ok(dropped.len())
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("submission_phys", &self.submission_phys)
            .field("completion_phys", &self.completion_phys)
            .finish_non_exhaustive()
    }
}
