use std::sync::Arc;

use thiserror::Error;

use crate::h2::Reason;
use crate::target::TargetError;
use crate::BoxError;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The request or the peer violated the protocol.
    Protocol,

    /// The session refused a new stream because it is at its concurrency cap.
    Capacity,

    /// A connection could not be established, or failed while in use.
    Connection,

    /// No session could be leased before the deadline.
    Timeout,

    /// The exchange was cancelled.
    Cancelled,

    /// An exchange handler callback failed.
    Handler,
}

/// Errors surfaced to exchange handlers and callers.
///
/// Errors are cheap to clone so that a single connection failure can be
/// reported to every exchange in flight on that connection.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The request has no authority to route it by.
    #[error("request target has no authority")]
    MissingAuthority,

    /// The request target could not be resolved.
    #[error(transparent)]
    InvalidTarget(#[from] TargetError),

    /// The peer or the local handler violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session already has the maximum number of concurrent streams open.
    #[error("maximum number of concurrent streams ({max_concurrent_streams}) reached")]
    Rejected {
        /// The concurrency cap in effect at the time of the submission.
        max_concurrent_streams: u32,
    },

    /// The session was closed before or during the exchange.
    #[error("connection closed")]
    ConnectionClosed,

    /// The pool has been closed, no connection can be made.
    #[error("pool closed, no connection can be made")]
    Unavailable,

    /// Establishing the connection failed.
    #[error("connecting: {0}")]
    Connect(#[source] Arc<BoxError>),

    /// The connection failed while in use.
    #[error("transport: {0}")]
    Transport(#[source] Arc<BoxError>),

    /// No session was leased before the deadline.
    #[error("timed out waiting for a connection")]
    Timeout,

    /// The peer reset the stream.
    #[error("stream reset by peer: {0}")]
    StreamReset(Reason),

    /// The peer is shutting the connection down and did not process the stream.
    #[error("connection going away: {0}")]
    GoAway(Reason),

    /// The exchange was cancelled.
    #[error("exchange cancelled")]
    Cancelled,

    /// An exchange handler callback failed.
    #[error("handler: {0}")]
    Handler(#[source] Arc<BoxError>),

    /// An `https` target was requested but no TLS strategy is configured.
    #[error("no TLS strategy configured for secure target")]
    NoTlsStrategy,
}

impl Error {
    /// Wrap a connect-time failure.
    pub fn connect<E: Into<BoxError>>(error: E) -> Self {
        Error::Connect(Arc::new(error.into()))
    }

    /// Wrap an I/O failure of an established connection.
    pub fn transport<E: Into<BoxError>>(error: E) -> Self {
        Error::Transport(Arc::new(error.into()))
    }

    /// Wrap a failure raised by an exchange handler.
    pub fn handler<E: Into<BoxError>>(error: E) -> Self {
        Error::Handler(Arc::new(error.into()))
    }

    /// Build a protocol error from a message.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Error::Protocol(message.into())
    }

    /// The class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAuthority
            | Error::InvalidTarget(_)
            | Error::Protocol(_)
            | Error::StreamReset(_)
            | Error::NoTlsStrategy => ErrorKind::Protocol,
            Error::Rejected { .. } => ErrorKind::Capacity,
            Error::ConnectionClosed
            | Error::Unavailable
            | Error::Connect(_)
            | Error::Transport(_)
            | Error::GoAway(_) => ErrorKind::Connection,
            Error::Timeout => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Handler(_) => ErrorKind::Handler,
        }
    }

    /// Was this exchange cancelled rather than failed?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Was the submission rejected because the session was at capacity?
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }

    /// Did the lease time out?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::transport(error)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync, Clone, Into<BoxError>);

    #[test]
    fn kinds() {
        assert_eq!(Error::MissingAuthority.kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::Rejected {
                max_concurrent_streams: 1
            }
            .kind(),
            ErrorKind::Capacity
        );
        assert_eq!(Error::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::GoAway(Reason::NO_ERROR).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).kind(),
            ErrorKind::Connection
        );
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::Rejected {
                max_concurrent_streams: 4
            }
            .to_string(),
            "maximum number of concurrent streams (4) reached"
        );
        assert_eq!(
            Error::StreamReset(Reason::CANCEL).to_string(),
            "stream reset by peer: CANCEL"
        );
    }
}
