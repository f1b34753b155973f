//! Request splitting.
//!
//! A caller request is cut into commands no larger than the controller's
//! transfer limit and describable by one PRP list. The whole command list is
//! planned before anything is queued, so the request's [`Iocp`] can be armed
//! with the exact command count up front.

use crate::controller::NamespaceInfo;
use crate::platform::{PhysRange, Platform};
use crate::queue_pair::{CompletionHandler, MAX_PRP_RANGES, Payload, QueuePair};
use crate::wire::{Command, DatasetRange};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_storage::{IoBuffer, IoError, IoOwner, Iocp};
use kernel_sync::Deadline;
use log::{trace, warn};

/// Blocks a single read or write command can move.
const MAX_BLOCKS_PER_COMMAND: u64 = 0x1_0000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum IoOp {
    Read,
    Write { fua: bool },
    Flush,
    /// Deallocate the blocks.
    Trim,
}

/// A block request against one namespace.
#[derive(Debug, Copy, Clone)]
pub(crate) struct IoRequest {
    pub op: IoOp,
    pub lba: u64,
    pub buffer: IoBuffer,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Planned {
    None,
    /// Indices into [`Plan::ranges`].
    Ranges(Range<usize>),
    Dataset(DatasetRange),
}

/// Commands a request is split into, with the physical ranges their data
/// pointers are built from.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    commands: Vec<(Command, Planned)>,
    ranges: Vec<PhysRange>,
}

impl Plan {
    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    /// Splits `request` for namespace `ns`.
    ///
    /// # Errors
    /// [`IoError::InvalidArgument`] for an empty or out-of-range request, a
    /// buffer too small for it, or a buffer the platform cannot translate.
    pub(crate) fn new(
        ns: &NamespaceInfo,
        request: &IoRequest,
        max_transfer: usize,
        supports_trim: bool,
        platform: &dyn Platform,
    ) -> Result<Self, IoError> {
        let mut plan = Self::default();
        match request.op {
            IoOp::Flush => plan.commands.push((Command::flush(ns.nsid), Planned::None)),
            IoOp::Trim => {
                if !supports_trim {
                    return Err(IoError::InvalidArgument);
                }
                check_range(ns, request.lba, request.count)?;
                plan.split_trim(ns.nsid, request.lba, request.count);
            }
            IoOp::Read | IoOp::Write { .. } => {
                check_range(ns, request.lba, request.count)?;
                plan.split_transfer(ns, request, max_transfer, platform)?;
            }
        }
        Ok(plan)
    }

    fn split_trim(&mut self, nsid: u32, mut lba: u64, mut remaining: u64) {
        while remaining > 0 {
            let blocks = remaining.min(u64::from(u32::MAX));
            #[allow(clippy::cast_possible_truncation)]
            let range = DatasetRange {
                context_attributes: 0,
                lba_count: blocks as u32,
                starting_lba: lba,
            };
            self.commands.push((Command::deallocate(nsid), Planned::Dataset(range)));
            lba += blocks;
            remaining -= blocks;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn split_transfer(
        &mut self,
        ns: &NamespaceInfo,
        request: &IoRequest,
        max_transfer: usize,
        platform: &dyn Platform,
    ) -> Result<(), IoError> {
        let block_size = 1usize << ns.block_size_log2;
        let total = usize::try_from(request.count)
            .ok()
            .and_then(|count| count.checked_mul(block_size))
            .ok_or(IoError::InvalidArgument)?;
        if request.buffer.len() < total {
            return Err(IoError::InvalidArgument);
        }
        let per_command = max_transfer.min(MAX_BLOCKS_PER_COMMAND as usize * block_size) & !(block_size - 1);
        if per_command == 0 {
            return Err(IoError::InvalidArgument);
        }

        let mut lba = request.lba;
        let mut offset = 0;
        while offset < total {
            let wanted = (total - offset).min(per_command);
            let first = self.ranges.len();
            let at = request.buffer.as_ptr().wrapping_add(offset);
            let covered = platform.phys_ranges(at, wanted, MAX_PRP_RANGES, &mut self.ranges);
            let bytes = if covered < wanted {
                covered & !(block_size - 1)
            } else {
                wanted
            };
            if bytes == 0 {
                warn!("Buffer at {at:p} cannot be translated for DMA");
                return Err(IoError::InvalidArgument);
            }
            truncate_ranges(&mut self.ranges, first, bytes);

            let blocks = (bytes / block_size) as u32;
            let command = match request.op {
                IoOp::Write { fua } => Command::write(ns.nsid, lba, blocks, fua),
                _ => Command::read(ns.nsid, lba, blocks),
            };
            self.commands.push((command, Planned::Ranges(first..self.ranges.len())));
            lba += u64::from(blocks);
            offset += bytes;
        }
        Ok(())
    }
}

fn check_range(ns: &NamespaceInfo, lba: u64, count: u64) -> Result<(), IoError> {
    match lba.checked_add(count) {
        Some(end) if count > 0 && end <= ns.block_count => Ok(()),
        _ => Err(IoError::InvalidArgument),
    }
}

/// Cuts the ranges from `first` on down to exactly `bytes`.
fn truncate_ranges(ranges: &mut Vec<PhysRange>, first: usize, bytes: usize) {
    let mut kept = 0;
    let mut end = first;
    while end < ranges.len() && kept < bytes {
        let range = &mut ranges[end];
        range.len = range.len.min(bytes - kept);
        kept += range.len;
        end += 1;
    }
    ranges.truncate(end);
}

/// Queues every command of `plan` on `queue`, reporting into `iocp`.
///
/// `iocp` is armed before the first submission. A command that cannot be
/// queued is reported to `iocp` as failed, so the port still fires once.
pub(crate) fn submit_plan(plan: &Plan, queue: &QueuePair, deadline: &Deadline<'_>, iocp: &Arc<Iocp>) {
    #[allow(clippy::cast_possible_truncation)]
    iocp.set_expect(plan.commands.len() as u32);
    let owner = IoOwner::of(iocp);

    for (command, planned) in &plan.commands {
        let payload = match planned {
            Planned::None => Payload::None,
            Planned::Ranges(range) => Payload::Ranges(&plan.ranges[range.clone()]),
            Planned::Dataset(range) => Payload::DatasetRange(*range),
        };
        let port = Arc::clone(iocp);
        let handler: CompletionHandler = Box::new(move |event| port.complete(event.result()));
        match queue.submit(*command, handler, Some(owner), deadline, payload) {
            Ok(cid) => trace!("Queue {}: request command {cid} queued", queue.id()),
            Err(err) => {
                warn!("Queue {}: dropping command of a split request: {err}", queue.id());
                iocp.complete(Err(err.into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{DmaRegion, PhysAddr};
    use crate::wire::{Cdw12ReadWrite, NvmOpcode, PAGE_SIZE};
    use kernel_sync::Clock;

    /// Identity-mapped platform, optionally refusing to translate past a
    /// given address.
    struct Mapped {
        limit: usize,
    }

    impl Clock for Mapped {
        fn now_ns(&self) -> u64 {
            0
        }
    }

    impl Platform for Mapped {
        fn alloc_dma(&self, _len: usize) -> Option<DmaRegion> {
            None
        }

        fn free_dma(&self, _region: DmaRegion) {}

        fn phys_addr(&self, virt: *const u8) -> Option<PhysAddr> {
            ((virt as usize) < self.limit).then_some(PhysAddr(virt as u64))
        }

        fn current_cpu(&self) -> usize {
            0
        }

        fn cpu_count(&self) -> usize {
            1
        }
    }

    const UNLIMITED: Mapped = Mapped { limit: usize::MAX };

    const NS: NamespaceInfo = NamespaceInfo {
        nsid: 1,
        block_size_log2: 9,
        block_count: 1 << 20,
    };

    fn buffer(at: usize, len: usize) -> IoBuffer {
        unsafe { IoBuffer::from_raw_parts(core::ptr::NonNull::new(at as *mut u8).unwrap(), len) }
    }

    fn read(lba: u64, buffer: IoBuffer, count: u64) -> IoRequest {
        IoRequest {
            op: IoOp::Read,
            lba,
            buffer,
            count,
        }
    }

    fn blocks(command: &Command) -> u32 {
        u32::from(Cdw12ReadWrite::from(command.cdw12).nlb_z()) + 1
    }

    fn lba(command: &Command) -> u64 {
        u64::from(command.cdw10) | (u64::from(command.cdw11) << 32)
    }

    #[test]
    fn a_200k_read_becomes_four_commands() {
        let request = read(100, buffer(0x10_0000, 200 * 1024), 400);
        let plan = Plan::new(&NS, &request, 64 * 1024, false, &UNLIMITED).unwrap();
        assert_eq!(plan.len(), 4);

        let split: Vec<_> = plan.commands.iter().map(|(c, _)| (lba(c), blocks(c))).collect();
        assert_eq!(split, vec![(100, 128), (228, 128), (356, 128), (484, 16)]);
        assert!(plan.commands.iter().all(|(c, _)| c.opcode() == NvmOpcode::Read as u8));
    }

    #[test]
    fn ranges_of_each_command_cover_its_bytes() {
        let request = read(0, buffer(0x10_0200, 96 * 1024), 192);
        let plan = Plan::new(&NS, &request, 64 * 1024, false, &UNLIMITED).unwrap();
        for (command, planned) in &plan.commands {
            let Planned::Ranges(range) = planned else {
                panic!("transfer without data pointer");
            };
            let bytes: usize = plan.ranges[range.clone()].iter().map(|r| r.len).sum();
            assert_eq!(bytes, blocks(command) as usize * 512);
            assert!(range.len() <= MAX_PRP_RANGES);
        }
        assert_eq!(plan.ranges[0].addr, PhysAddr(0x10_0200));
    }

    #[test]
    fn fragmentation_shrinks_the_chunk_to_whole_blocks() {
        // 17 page-bounded ranges starting 0x300 into a page cover
        // 0xD00 + 16 pages; rounded down to 512-byte blocks.
        let request = read(0, buffer(0x10_0300, 128 * 1024), 256);
        let plan = Plan::new(&NS, &request, 128 * 1024, false, &UNLIMITED).unwrap();
        let first = &plan.commands[0].0;
        let covered = (PAGE_SIZE - 0x300) + 16 * PAGE_SIZE;
        assert_eq!(blocks(first) as usize, covered / 512);

        let total: u32 = plan.commands.iter().map(|(c, _)| blocks(c)).sum();
        assert_eq!(total, 256);
    }

    #[test]
    fn write_carries_fua() {
        let request = IoRequest {
            op: IoOp::Write { fua: true },
            lba: 8,
            buffer: buffer(0x20_0000, 4096),
            count: 8,
        };
        let plan = Plan::new(&NS, &request, 64 * 1024, false, &UNLIMITED).unwrap();
        let (command, _) = &plan.commands[0];
        assert_eq!(command.opcode(), NvmOpcode::Write as u8);
        assert!(Cdw12ReadWrite::from(command.cdw12).fua());
    }

    #[test]
    fn invalid_requests_are_rejected_before_planning() {
        let small = buffer(0x10_0000, 512);
        for request in [
            read(0, small, 0),
            read(NS.block_count, small, 1),
            read(u64::MAX, small, 2),
            read(0, small, 2),
        ] {
            assert_eq!(
                Plan::new(&NS, &request, 64 * 1024, false, &UNLIMITED).unwrap_err(),
                IoError::InvalidArgument
            );
        }
    }

    #[test]
    fn untranslatable_buffers_are_rejected() {
        let request = read(0, buffer(0x10_0000, 4096), 8);
        let plan = Plan::new(&NS, &request, 64 * 1024, false, &Mapped { limit: 0x1000 });
        assert_eq!(plan.unwrap_err(), IoError::InvalidArgument);
    }

    #[test]
    fn trim_splits_at_the_range_limit() {
        let ns = NamespaceInfo {
            block_count: u64::MAX,
            ..NS
        };
        let request = IoRequest {
            op: IoOp::Trim,
            lba: 10,
            buffer: IoBuffer::empty(),
            count: u64::from(u32::MAX) + 5,
        };
        let plan = Plan::new(&ns, &request, 64 * 1024, true, &UNLIMITED).unwrap();
        let ranges: Vec<_> = plan
            .commands
            .iter()
            .map(|(command, planned)| {
                assert_eq!(command.opcode(), NvmOpcode::DatasetManagement as u8);
                match planned {
                    Planned::Dataset(range) => (range.starting_lba, range.lba_count),
                    other => panic!("unexpected payload {other:?}"),
                }
            })
            .collect();
        assert_eq!(ranges, vec![(10, u32::MAX), (10 + u64::from(u32::MAX), 5)]);

        assert_eq!(
            Plan::new(&NS, &request, 64 * 1024, false, &UNLIMITED).unwrap_err(),
            IoError::InvalidArgument,
            "trim on a controller without dataset management"
        );
    }

    #[test]
    fn flush_is_a_single_command_without_data() {
        let request = IoRequest {
            op: IoOp::Flush,
            lba: 0,
            buffer: IoBuffer::empty(),
            count: 0,
        };
        let plan = Plan::new(&NS, &request, 64 * 1024, false, &UNLIMITED).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.commands[0].1, Planned::None);
    }
}
