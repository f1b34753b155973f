use crate::{IoBuffer, IoError, Iocp};
use alloc::string::String;
use alloc::sync::Arc;

/// Identifies the submitter of in-flight requests for
/// [`StorageDevice::cancel_io`].
///
/// Derived from the address of the request's [`Iocp`], so every request
/// reporting into the same port shares one owner.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IoOwner(usize);

impl IoOwner {
    /// The owner of every request reporting into `iocp`.
    ///
    /// Two ports alive at the same time never share an owner. Once a port
    /// is freed its address may be reused, so the `Arc` must be kept alive
    /// for as long as commands tagged with its owner are in flight. Drivers
    /// get this for free by holding a clone in each completion handler.
    #[must_use]
    pub fn of(iocp: &Arc<Iocp>) -> Self {
        Self(Arc::as_ptr(iocp) as usize)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InfoKey {
    /// Logical block size in bytes.
    BlockSize,
    BlockSizeLog2,
    /// Capacity in logical blocks.
    BlockCount,
    /// Whether [`StorageDevice::trim_async`] is supported.
    HaveTrim,
    /// Driver-level device name.
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoValue {
    Number(u64),
    Flag(bool),
    Text(String),
}

impl InfoValue {
    #[must_use]
    pub const fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// A block device.
///
/// The `*_async` operations validate the request, queue it and return. The
/// outcome arrives through `iocp`, which the implementation arms with
/// [`Iocp::set_expect`] before any of its commands can complete. An `Err`
/// return means nothing was queued and `iocp` will not fire.
pub trait StorageDevice: Send + Sync {
    /// Reads `count` blocks starting at `lba` into `buffer`.
    ///
    /// # Errors
    /// [`IoError::InvalidArgument`] if the range or buffer is out of bounds,
    /// [`IoError::NotReady`] if the device cannot accept I/O.
    fn read_async(&self, lba: u64, buffer: IoBuffer, count: u32, iocp: &Arc<Iocp>) -> Result<(), IoError>;

    /// Writes `count` blocks from `buffer` at `lba`; `fua` forces the data to
    /// stable media before completion.
    ///
    /// # Errors
    /// As [`read_async`](Self::read_async).
    fn write_async(
        &self,
        lba: u64,
        buffer: IoBuffer,
        count: u32,
        fua: bool,
        iocp: &Arc<Iocp>,
    ) -> Result<(), IoError>;

    /// # Errors
    /// [`IoError::NotReady`] if the device cannot accept I/O.
    fn flush_async(&self, iocp: &Arc<Iocp>) -> Result<(), IoError>;

    /// Marks `count` blocks at `lba` as unused.
    ///
    /// # Errors
    /// [`IoError::InvalidArgument`] for an out-of-range request.
    fn trim_async(&self, lba: u64, count: u64, iocp: &Arc<Iocp>) -> Result<(), IoError>;

    /// Drops the completion handlers of every request reporting into `iocp`.
    ///
    /// The device may still complete those commands and access their
    /// buffers; callers must keep the memory alive until it does.
    ///
    /// # Errors
    /// [`IoError::NotFound`] if no request of this owner was in flight.
    fn cancel_io(&self, iocp: &Arc<Iocp>) -> Result<usize, IoError>;

    fn info(&self, key: InfoKey) -> Option<InfoValue>;

    /// Synchronous read on top of [`read_async`](Self::read_async).
    ///
    /// # Errors
    /// Submission errors or the device's completion status.
    fn read(&self, lba: u64, buffer: IoBuffer, count: u32) -> Result<(), IoError> {
        let iocp = Arc::new(Iocp::blocking());
        self.read_async(lba, buffer, count, &iocp)?;
        iocp.wait()
    }

    /// Synchronous write on top of [`write_async`](Self::write_async).
    ///
    /// # Errors
    /// Submission errors or the device's completion status.
    fn write(&self, lba: u64, buffer: IoBuffer, count: u32, fua: bool) -> Result<(), IoError> {
        let iocp = Arc::new(Iocp::blocking());
        self.write_async(lba, buffer, count, fua, &iocp)?;
        iocp.wait()
    }

    /// # Errors
    /// Submission errors or the device's completion status.
    fn flush(&self) -> Result<(), IoError> {
        let iocp = Arc::new(Iocp::blocking());
        self.flush_async(&iocp)?;
        iocp.wait()
    }
}
