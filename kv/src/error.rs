use thiserror::Error;

/// Errors produced by the store core.
///
/// Each variant corresponds to a client-visible error class; the server
/// boundary (in `kv-cli`) maps these to `tonic::Status` codes. Variants are
/// structured rather than free-form strings so that mapping does not rely on
/// matching on message text.
#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("required revision has been compacted, compact revision is {compact_revision}")]
    Compacted { compact_revision: i64 },

    #[error("required revision is a future revision, current revision is {current_revision}")]
    FutureRev { current_revision: i64 },

    #[error("lease {id} not found")]
    LeaseNotFound { id: i64 },

    #[error("lease {id} already exists")]
    LeaseExists { id: i64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("canceled")]
    Canceled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convenience constructor mirroring the upstream crate's use of
    /// ad-hoc string errors for unexpected engine faults.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

pub type CResult<T> = Result<T, Error>;
