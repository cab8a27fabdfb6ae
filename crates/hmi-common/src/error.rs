use std::fmt;
use thiserror::Error;

/// Link error types covering transport faults, framing and correlation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    /// Transport-level I/O error (connect refused, reset, write failure).
    #[error("I/O error: {0}")]
    Io(String),

    /// The peer closed the stream between frames.
    #[error("peer lost")]
    PeerLost,

    /// The peer closed the stream in the middle of a frame.
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes the frame still required.
        expected: usize,
        /// Bytes actually buffered when the stream ended.
        received: usize,
    },

    /// Not enough bytes to decode a header or trailer.
    #[error("insufficient bytes: need {needed}, have {available}")]
    Insufficient {
        /// Bytes required by the decoder.
        needed: usize,
        /// Bytes available in the input.
        available: usize,
    },

    /// The byte stream cannot be framed any further (declared length out of range).
    #[error("framing error: {0}")]
    Framing(String),

    /// A reply referenced a transaction that is not in flight.
    #[error("unknown or non-pending transaction {0}")]
    UnknownTransaction(u16),

    /// A request was rejected before being queued.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The client engine has stopped.
    #[error("link closed")]
    Closed,

    /// Invalid connection state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::PeerLost,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Convenience type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Reason a transaction was retired without a reply.
///
/// Reported to the caller's confirmation object; never raised as an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFailure {
    /// No reply arrived within the configured transaction timeout.
    TimedOut,
    /// The connection dropped while the transaction was in flight.
    ConnectionLost,
    /// The reconnect circuit is open; the request was never sent.
    Unreachable,
}

impl fmt::Display for TransactionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Unreachable => write!(f, "device unreachable"),
        }
    }
}
