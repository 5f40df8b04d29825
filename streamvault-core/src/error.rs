use thiserror::Error;

/// Error taxonomy shared across StreamVault crates.
///
/// Variants map to a recovery policy rather than a component: the recording
/// task funnels every retryable kind into its retry loop, the HTTP layer maps
/// the surface-able kinds onto status codes, and the health checker absorbs
/// device-level failures silently.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("path '{0}' is not configured")]
    PathNotConfigured(String),

    #[error("path '{0}' not found")]
    PathNotFound(String),

    #[error("no one is publishing to path '{0}'")]
    PathNotReady(String),

    #[error("path '{0}' is terminating")]
    PathTerminating(String),

    #[error("another publisher is already bound to path '{0}'")]
    PublisherAlreadyBound(String),

    #[error("authentication denied")]
    AuthDenied,

    #[error("stream is closed")]
    StreamClosed,

    #[error("reader lagged behind and was dropped")]
    ReaderLagged,

    #[error("task id that does not exist")]
    TaskNotFound(String),

    #[error("capture device '{0}' unavailable")]
    DeviceUnavailable(String),

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("muxer error: {0}")]
    Muxer(String),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a recording task may retry after seeing this error.
    ///
    /// Everything except an explicit stop is retryable from the task's point
    /// of view; the non-retryable kinds simply never reach it.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PathNotFound(_)
                | Self::PathNotReady(_)
                | Self::StreamClosed
                | Self::ReaderLagged
                | Self::Muxer(_)
                | Self::Filesystem(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
