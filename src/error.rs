use thiserror::Error;

use crate::managed_name::InvalidManagedNameError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("INVALID_ARGUMENT: {0}")]
    InvalidArgument(String),

    #[error("QUEUE_DISPOSED: Job queue '{0}' has already been disposed.")]
    QueueDisposed(String),

    #[error("QUEUE_PAUSED: Job queue '{0}' is paused. Call resume() before dispose().")]
    QueuePaused(String),

    #[error("INVALID_MANAGED_NAME: {0}")]
    InvalidManagedName(#[from] InvalidManagedNameError),

    #[error("NOT_SUPPORTED: {0}")]
    NotSupported(String),

    #[error("NOT_IMPLEMENTED: {0}")]
    NotImplemented(String),

    #[error("NOT_CONNECTED: No connected channel. Wait for a connection before sending.")]
    NotConnected,

    #[error("CONNECTION_TIMEOUT: No connection within {0} ms.")]
    ConnectionTimeout(u64),

    #[error("CONNECTION_CLOSED: {0}")]
    ConnectionClosed(String),

    #[error("FRAME_TOO_LARGE: Frame of {size} bytes exceeds limit of {max} bytes.")]
    FrameTooLarge { size: usize, max: usize },

    #[error("VERSION_CHECK_FAILED: {0}")]
    VersionCheckFailed(String),

    #[error("PROTOCOL_ERROR: {0}")]
    Protocol(String),

    #[error("CANCELLED: {0}")]
    Cancelled(String),

    #[error("TEST_HOST_LAUNCH_FAILED: {0}")]
    TestHostLaunchFailed(String),

    #[error("TEST_HOST_EXITED: Test host process exited unexpectedly. {0}")]
    TestHostExited(String),

    #[error("ADAPTER_FAILED: {adapter}: {reason}")]
    AdapterFailed { adapter: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
