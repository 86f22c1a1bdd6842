use std::io;
use thiserror::Error;

/// Every failure surfaced by the crate maps to one of these kinds.
///
/// Cache operations never fail. Archive sessions latch the first error they
/// see and backend operations report it when the session is finished.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("File doesn't exist")]
    NotFound,
    #[error("Target file already exists")]
    Exists,
    #[error("Can't open directory")]
    IsDirectory,
    #[error("The file is not a directory")]
    NotDirectory,
    #[error("Can't recursively copy directory")]
    WouldRecurse,
    #[error("Can't move directory over directory")]
    WouldMerge,
    #[error("Can't do multiple write operations")]
    Busy,
    #[error("Operation not supported")]
    NotSupported,
    #[error("Not a mountable file")]
    NotMountable,
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("Archive error: {source}")]
    Failed {
        #[from]
        source: anyhow::Error,
    },
}

impl Error {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
