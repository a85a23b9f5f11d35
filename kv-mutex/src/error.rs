use std::fmt::{self, Display};
use std::string::FromUtf8Error;
use std::sync::PoisonError;

/// All errors surfaced by this crate. Store failures keep their message but
/// lose the backing store's concrete type, since the store is pluggable.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The operation was cancelled through its cancellation token.
    Cancelled,

    /// Persisted bytes did not decode as the schema expects. This points at
    /// data corruption or a foreign writer under the same subspace.
    DecodingFailed(String),

    /// A failure reported by the store after its own retries were exhausted.
    Store(String),

    /// An in-process invariant broke, e.g. a poisoned lock or a malformed
    /// mutation buffer.
    Internal(String),
}

pub type CResult<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::DecodingFailed(msg) => write!(f, "decoding failed: {msg}"),
            Error::Store(msg) => write!(f, "store error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<FromUtf8Error> for Error {
    fn from(err: FromUtf8Error) -> Self {
        Error::DecodingFailed(err.to_string())
    }
}
