//! HTTP/2 stream multiplexing.
//!
//! The protocol engine is [`Multiplexer`], a state machine with no I/O of
//! its own. [`Http2Session`] runs a multiplexer over a [`FrameCodec`] in a
//! spawned driver task, and is what the pool hands out.
//!
//! HPACK and the byte-level framing are not part of this crate: a codec turns
//! the transport into a stream and sink of decoded [`Frame`]s. [`pipe`]
//! provides an in-memory codec pair for tests and for embedding.

use std::io;

use futures_util::{Sink, Stream};

mod flow;
mod frame;
mod listener;
mod mux;
mod pipe;
mod session;
mod stream;

pub use self::flow::{FlowControl, FlowControlError, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
pub use self::frame::{Frame, HeaderBlock, Pseudo, Reason, Settings, StreamId};
pub use self::listener::{FrameListener, TracingListener};
pub use self::mux::{ConnectionError, Multiplexer};
pub use self::pipe::{pipe, FramePipe, PipePeer};
pub use self::session::{Http2Session, SessionDriver};
pub use self::stream::StreamState;

/// What to do with a submission when the connection is at its stream limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmissionPolicy {
    /// Fail the exchange with [`Error::Rejected`](crate::Error::Rejected).
    #[default]
    Reject,

    /// Hold the exchange until a stream closes. Held exchanges start in
    /// submission order.
    Queue,
}

/// HTTP/2 session configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local cap on concurrently open streams. The effective cap is the
    /// smaller of this and the peer's SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: u32,

    /// Behavior at the stream limit.
    pub submission_policy: SubmissionPolicy,

    /// Receive window for each stream.
    pub initial_window_size: u32,

    /// Receive window for the whole connection.
    pub connection_window_size: u32,

    /// Largest frame payload we accept.
    pub max_frame_size: u32,

    /// Accept server push.
    pub push_enabled: bool,

    /// Advertised SETTINGS_MAX_HEADER_LIST_SIZE.
    pub max_header_list_size: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            submission_policy: SubmissionPolicy::default(),
            initial_window_size: DEFAULT_WINDOW_SIZE,
            connection_window_size: 1024 * 1024,
            max_frame_size: 16_384,
            push_enabled: false,
            max_header_list_size: None,
        }
    }
}

impl Config {
    /// Set the local stream cap.
    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Set the behavior at the stream limit.
    pub fn with_submission_policy(mut self, policy: SubmissionPolicy) -> Self {
        self.submission_policy = policy;
        self
    }

    /// Set the per-stream receive window.
    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size.min(MAX_WINDOW_SIZE);
        self
    }

    /// Set the connection receive window.
    pub fn with_connection_window_size(mut self, size: u32) -> Self {
        self.connection_window_size = size.min(MAX_WINDOW_SIZE);
        self
    }

    /// Accept server push.
    pub fn with_push(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }

    pub(crate) fn local_settings(&self) -> Settings {
        Settings {
            header_table_size: None,
            enable_push: Some(self.push_enabled),
            max_concurrent_streams: self
                .push_enabled
                .then_some(self.max_concurrent_streams),
            initial_window_size: Some(self.initial_window_size),
            max_frame_size: Some(self.max_frame_size),
            max_header_list_size: self.max_header_list_size,
        }
    }
}

/// A transport speaking decoded HTTP/2 frames.
pub trait FrameCodec:
    Stream<Item = io::Result<Frame>> + Sink<Frame, Error = io::Error> + Send + Unpin + 'static
{
}

impl<T> FrameCodec for T where
    T: Stream<Item = io::Result<Frame>> + Sink<Frame, Error = io::Error> + Send + Unpin + 'static
{
}

/// A type-erased frame codec.
pub type BoxCodec = Box<dyn FrameCodec>;

/// Wraps a connected transport in a frame codec.
pub trait CodecFactory: Send + Sync + 'static {
    /// Build the codec for a freshly connected stream.
    fn codec(&self, stream: crate::conn::Stream) -> BoxCodec;
}

impl<F> CodecFactory for F
where
    F: Fn(crate::conn::Stream) -> BoxCodec + Send + Sync + 'static,
{
    fn codec(&self, stream: crate::conn::Stream) -> BoxCodec {
        (self)(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Config: Send, Sync, Clone);
    static_assertions::assert_impl_all!(FramePipe: FrameCodec);

    #[test]
    fn settings_without_push() {
        let settings = Config::default().local_settings();
        assert_eq!(settings.enable_push, Some(false));
        assert_eq!(settings.max_concurrent_streams, None);
        assert_eq!(settings.initial_window_size, Some(65_535));
    }

    #[test]
    fn settings_with_push() {
        let settings = Config::default()
            .with_push(true)
            .with_max_concurrent_streams(8)
            .local_settings();
        assert_eq!(settings.enable_push, Some(true));
        assert_eq!(settings.max_concurrent_streams, Some(8));
    }
}
