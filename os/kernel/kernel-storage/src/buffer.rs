use core::fmt;
use core::ptr::NonNull;

/// A caller-owned data buffer handed to an asynchronous request.
///
/// The buffer is described by raw parts because the request outlives any
/// borrow the caller could lend: the device reads or writes it via DMA until
/// the request's [`Iocp`](crate::Iocp) fires.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct IoBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: an IoBuffer is only an address range; the creator guarantees
// exclusive access for the duration of the request.
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    /// A zero-length buffer, for requests that carry no data.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    /// # Safety
    /// `ptr..ptr + len` must be valid for reads and writes and must not be
    /// accessed by anyone else until the request it is passed to completes.
    #[must_use]
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// # Safety
    /// The slice must outlive the request it is passed to, and must not be
    /// touched until that request completes.
    #[must_use]
    pub unsafe fn from_slice(slice: &mut [u8]) -> Self {
        let len = slice.len();
        Self {
            ptr: NonNull::from(slice).cast(),
            len,
        }
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The part of the buffer starting `offset` bytes in.
    ///
    /// # Panics
    /// If `offset > len`.
    #[must_use]
    pub fn offset(&self, offset: usize) -> Self {
        assert!(offset <= self.len, "offset {offset} past buffer end {}", self.len);
        // SAFETY: in bounds per the assertion.
        let ptr = unsafe { self.ptr.add(offset) };
        Self {
            ptr,
            len: self.len - offset,
        }
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoBuffer({:p}, {} bytes)", self.ptr, self.len)
    }
}
