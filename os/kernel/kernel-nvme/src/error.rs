use kernel_storage::IoError;

/// Failure to queue a command on a queue pair. Nothing was submitted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("timed out waiting for a free submission slot")]
    TimedOut,
    #[error("{count} physical ranges exceed the PRP limit of {}", crate::queue_pair::MAX_PRP_RANGES)]
    TooManyRanges { count: usize },
}

impl From<SubmitError> for IoError {
    fn from(value: SubmitError) -> Self {
        match value {
            SubmitError::TimedOut => Self::TimedOut,
            SubmitError::TooManyRanges { .. } => Self::InvalidArgument,
        }
    }
}

/// Controller bring-up step, for error reporting.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Disable,
    Enable,
    SetQueueCount,
    CreateQueues,
    IdentifyController,
    HostMemoryBuffer,
    IdentifyNamespaces,
}

/// Failure to bring a controller up. The controller is not usable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("controller did not respond in time during {0:?}")]
    Timeout(Stage),
    #[error("controller reported fatal status")]
    ControllerFatal,
    #[error("controller registers read all ones; device gone")]
    DeviceGone,
    #[error("failed to allocate {bytes} bytes of DMA memory")]
    OutOfMemory { bytes: usize },
    #[error("admin command failed during {stage:?}")]
    Command {
        stage: Stage,
        #[source]
        source: IoError,
    },
    #[error("no I/O queues available")]
    NoQueues,
}
