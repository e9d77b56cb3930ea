use std::io;

use thiserror::Error;

use crate::chunk::SocketId;

/// Failures of a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every link of the pool is gone and the pool fails fast.
    #[error("no live link left to carry chunks")]
    Exhausted,
    /// The pool was shut down.
    #[error("connection pool is shut down")]
    Closed,
    /// The socket id already has a reverse route.
    #[error("socket {0} is already registered")]
    DuplicateSocket(SocketId),
    /// The configuration was rejected.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),
    /// Opening or setting up a link failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<PoolError> for io::Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Io(err) => err,
            PoolError::Exhausted => io::Error::new(io::ErrorKind::NotConnected, err),
            PoolError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            PoolError::DuplicateSocket(_) => io::Error::new(io::ErrorKind::AlreadyExists, err),
            PoolError::InvalidConfig(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
        }
    }
}

/// Failures while reassembling a socket's stream.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Writing to the destination failed.
    #[error("write to destination of socket {socket_id} failed: {source}")]
    Io {
        /// The socket whose destination failed.
        socket_id: SocketId,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// Too many bytes are waiting behind a missing sequence.
    #[error("socket {socket_id} holds more than {limit} bytes waiting for sequence {expected}")]
    GapOverflow {
        /// The socket whose queue overflowed.
        socket_id: SocketId,
        /// The sequence the queue is stuck on.
        expected: u64,
        /// The configured bound.
        limit: usize,
    },
    /// The destination for a new socket could not be opened.
    #[error("cannot open destination for socket {socket_id}: {source}")]
    Open {
        /// The socket that needed a destination.
        socket_id: SocketId,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The queue already finished or failed.
    #[error("socket {0} is already closed")]
    Closed(SocketId),
}
