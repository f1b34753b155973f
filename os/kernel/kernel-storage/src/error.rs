/// Outcome of one I/O request as seen by its [`Iocp`](crate::Iocp).
pub type IoResult = Result<(), IoError>;

/// Errors reported by block devices.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// The device completed the command with a non-zero status.
    #[error("device error: status type {status_type:#x}, status code {status_code:#02x}")]
    Device { status_type: u8, status_code: u8 },
    #[error("operation timed out")]
    TimedOut,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no matching request or device")]
    NotFound,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("device not ready")]
    NotReady,
}
