use crate::controller::{NamespaceInfo, NvmeController};
use crate::io::{IoOp, IoRequest, Plan, submit_plan};
use alloc::string::ToString;
use alloc::sync::Arc;
use core::fmt;
use kernel_storage::{InfoKey, InfoValue, IoBuffer, IoError, IoOwner, Iocp, StorageDevice};
use kernel_sync::Deadline;

/// One active namespace of a controller, exposed as a block device.
pub struct NvmeNamespace {
    controller: Arc<NvmeController>,
    info: NamespaceInfo,
}

impl NvmeNamespace {
    pub(crate) const fn new(controller: Arc<NvmeController>, info: NamespaceInfo) -> Self {
        Self { controller, info }
    }

    #[must_use]
    pub const fn nsid(&self) -> u32 {
        self.info.nsid
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        1 << self.info.block_size_log2
    }

    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.info.block_count
    }

    #[must_use]
    pub const fn controller(&self) -> &Arc<NvmeController> {
        &self.controller
    }

    fn supports_trim(&self) -> bool {
        self.controller.identity().is_some_and(|id| id.supports_trim)
    }

    /// Splits `request` and queues it on the calling CPU's I/O queue.
    fn submit(&self, request: IoRequest, iocp: &Arc<Iocp>) -> Result<(), IoError> {
        let controller = &*self.controller;
        let platform = controller.platform();
        let queue = controller
            .io_queue_for(platform.current_cpu())
            .ok_or(IoError::NotReady)?;
        let plan = Plan::new(
            &self.info,
            &request,
            controller.max_transfer(),
            self.supports_trim(),
            platform,
        )?;

        let deadline = controller
            .config()
            .io_submit_timeout
            .map_or_else(Deadline::never, |timeout| Deadline::after(controller.clock(), timeout));
        submit_plan(&plan, queue, &deadline, iocp);
        Ok(())
    }
}

impl StorageDevice for NvmeNamespace {
    fn read_async(&self, lba: u64, buffer: IoBuffer, count: u32, iocp: &Arc<Iocp>) -> Result<(), IoError> {
        self.submit(
            IoRequest {
                op: IoOp::Read,
                lba,
                buffer,
                count: u64::from(count),
            },
            iocp,
        )
    }

    fn write_async(
        &self,
        lba: u64,
        buffer: IoBuffer,
        count: u32,
        fua: bool,
        iocp: &Arc<Iocp>,
    ) -> Result<(), IoError> {
        self.submit(
            IoRequest {
                op: IoOp::Write { fua },
                lba,
                buffer,
                count: u64::from(count),
            },
            iocp,
        )
    }

    fn flush_async(&self, iocp: &Arc<Iocp>) -> Result<(), IoError> {
        self.submit(
            IoRequest {
                op: IoOp::Flush,
                lba: 0,
                buffer: IoBuffer::empty(),
                count: 0,
            },
            iocp,
        )
    }

    fn trim_async(&self, lba: u64, count: u64, iocp: &Arc<Iocp>) -> Result<(), IoError> {
        self.submit(
            IoRequest {
                op: IoOp::Trim,
                lba,
                buffer: IoBuffer::empty(),
                count,
            },
            iocp,
        )
    }

    fn cancel_io(&self, iocp: &Arc<Iocp>) -> Result<usize, IoError> {
        let owner = IoOwner::of(iocp);
        #[allow(clippy::cast_possible_truncation)]
        let cancelled: usize = (1..self.controller.queue_count())
            .filter_map(|qid| self.controller.queue(qid as u16))
            .filter_map(|queue| queue.cancel(owner).ok())
            .sum();
        if cancelled == 0 {
            Err(IoError::NotFound)
        } else {
            Ok(cancelled)
        }
    }

    fn info(&self, key: InfoKey) -> Option<InfoValue> {
        Some(match key {
            InfoKey::BlockSize => InfoValue::Number(1 << self.info.block_size_log2),
            InfoKey::BlockSizeLog2 => InfoValue::Number(u64::from(self.info.block_size_log2)),
            InfoKey::BlockCount => InfoValue::Number(self.info.block_count),
            InfoKey::HaveTrim => InfoValue::Flag(self.supports_trim()),
            InfoKey::Name => InfoValue::Text("NVME".to_string()),
        })
    }
}

impl fmt::Debug for NvmeNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeNamespace")
            .field("nsid", &self.info.nsid)
            .field("block_size", &self.block_size())
            .field("block_count", &self.info.block_count)
            .finish_non_exhaustive()
    }
}
