use core::time::Duration;

/// Driver tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeConfig {
    /// Entries per queue; clamped to what the controller supports and rounded
    /// down to a power of two.
    pub queue_slots: u32,
    /// Upper bound on bytes moved by a single command; further limited by
    /// the controller's MDTS.
    pub max_transfer: usize,
    /// Upper bound on queue pairs, admin queue included.
    pub max_queues: usize,
    /// Size of each physically contiguous host memory buffer chunk.
    pub hmb_chunk: usize,
    /// Upper bound on host memory donated to one controller.
    pub hmb_limit: usize,
    /// How long an I/O submission may wait for a free slot. `None` waits
    /// indefinitely.
    pub io_submit_timeout: Option<Duration>,
}

impl Default for NvmeConfig {
    fn default() -> Self {
        Self {
            queue_slots: 1024,
            max_transfer: 64 * 1024,
            max_queues: 65,
            hmb_chunk: 2 * 1024 * 1024,
            hmb_limit: 64 * 1024 * 1024,
            io_submit_timeout: None,
        }
    }
}
