//! Error type shared by every layer of the engine.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Everything that can go wrong with a query.
///
/// Per-query failures are delivered through the query's completion target,
/// so the type is `Clone` to let one connection failure fan out to every
/// transaction that was riding on it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("query timed out")]
    Timeout,

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("transaction id {0} is already in use on the shared connection")]
    IdCollision(u16),

    #[error("unsupported query: {0}")]
    Unsupported(String),

    #[error("reply failed signature verification: {0}")]
    Signing(String),

    #[error("message of {0} bytes exceeds the maximum DNS message size")]
    TooLarge(usize),

    #[error("cannot resolve server address {0}")]
    Resolve(String),

    #[error("dispatcher is shut down")]
    Shutdown,
}

impl Error {
    /// True if the query ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True if sending the same question again, possibly elsewhere, may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Transport(_) | Error::ConnectionClosed | Error::Decode(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<hickory_proto::error::ProtoError> for Error {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
