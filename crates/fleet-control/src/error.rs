use thiserror::Error;

/// Errors surfaced by the control plane, classified by how callers react.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or request, fatal to the connection or request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No capacity right now (no node, no crawler, cordoned store)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// An admission wait outlived the caller's deadline
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A node reported on a request the control plane has no record of
    #[error("Data loss: {0}")]
    DataLoss(String),

    /// Storage, cache, broker or serialization failure
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_) | Error::DeadlineExceeded(_) | Error::Internal(_)
        )
    }
}

impl From<fleet_proto::FrameError> for Error {
    fn from(e: fleet_proto::FrameError) -> Self {
        match e {
            fleet_proto::FrameError::Malformed(_) => Error::InvalidArgument(e.to_string()),
            fleet_proto::FrameError::Encode(_) => Error::Internal(e.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
