//! Exchange handlers: the application side of a request/response exchange.
//!
//! An [`ExchangeHandler`] produces one request and consumes its response. The
//! session executing the exchange calls into the handler as the exchange
//! progresses: body data is pulled from the handler only when the transport
//! and the flow-control windows have room for it, and response data is pushed
//! into the handler as it arrives, with the handler deciding how much receive
//! credit to hand back to the peer.
//!
//! Every exchange ends with exactly one of [`ExchangeHandler::stream_end`] (or
//! [`ExchangeHandler::consume_response`] with `end_stream` set),
//! [`ExchangeHandler::failed`] or [`ExchangeHandler::cancel`], followed by
//! exactly one call to [`ExchangeHandler::release_resources`].

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http::HeaderMap;

use crate::cancel::Cancellable;
use crate::h2::StreamId;
use crate::session::{Command, CommandQueue, Priority};
use crate::version::VersionPolicy;
use crate::Error;

mod basic;
pub use self::basic::{
    BasicExchange, BytesRequest, BytesResponse, RequestProducer, ResponseConsumer,
    ResponseFuture, Trailers,
};

/// The head of a request produced by a handler.
#[derive(Debug)]
pub struct RequestHead {
    /// Method, URI, version and headers.
    pub parts: http::request::Parts,

    /// Will the handler produce a body? When `false` the request is sent as
    /// complete and [`ExchangeHandler::produce`] is never called.
    pub has_body: bool,
}

impl RequestHead {
    /// Create a request head.
    pub fn new(parts: http::request::Parts, has_body: bool) -> Self {
        Self { parts, has_body }
    }
}

/// Per-exchange state carried from submission to the session.
#[derive(Debug, Default)]
pub struct HttpContext {
    extensions: http::Extensions,
    version_policy: Option<VersionPolicy>,
    stream_id: Option<StreamId>,
}

impl HttpContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the requester's version policy for this exchange.
    pub fn with_version_policy(mut self, policy: VersionPolicy) -> Self {
        self.version_policy = Some(policy);
        self
    }

    /// The per-exchange version policy override, if any.
    pub fn version_policy(&self) -> Option<VersionPolicy> {
        self.version_policy
    }

    /// Arbitrary typed attributes attached to the exchange.
    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    /// Mutable access to the exchange attributes.
    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }

    /// The HTTP/2 stream carrying this exchange, once one has been allocated.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    pub(crate) fn set_stream_id(&mut self, id: StreamId) {
        self.stream_id = Some(id);
    }
}

/// A handle to an open stream, used to resume a handler later.
///
/// Handlers which have nothing to send (or are applying back-pressure on
/// receive) keep a handle and use it once they are ready again. The handle
/// also cancels the stream.
#[derive(Clone)]
pub struct StreamHandle {
    id: StreamId,
    queue: Weak<CommandQueue>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamHandle").field(&self.id).finish()
    }
}

impl StreamHandle {
    pub(crate) fn new(id: StreamId, queue: &Arc<CommandQueue>) -> Self {
        Self {
            id,
            queue: Arc::downgrade(queue),
        }
    }

    /// The stream identifier.
    pub fn id(&self) -> StreamId {
        self.id
    }

    fn push(&self, command: Command, priority: Priority) -> bool {
        match self.queue.upgrade() {
            Some(queue) => queue.push(command, priority).is_ok(),
            None => false,
        }
    }

    /// Ask the session to call [`ExchangeHandler::produce`] again.
    pub fn request_output(&self) -> bool {
        self.push(Command::RequestOutput(self.id), Priority::Normal)
    }

    /// Grant the peer `increment` more bytes of receive window.
    pub fn update_capacity(&self, increment: u32) -> bool {
        increment > 0 && self.push(Command::UpdateCapacity(self.id, increment), Priority::Normal)
    }
}

impl Cancellable for StreamHandle {
    fn cancel(&self) -> bool {
        self.push(Command::CancelStream(self.id), Priority::Immediate)
    }
}

/// Channel through which a handler writes request body data.
///
/// A channel accepts at most [`capacity`](DataChannel::capacity) bytes per
/// call to [`ExchangeHandler::produce`], bounded by the flow-control windows
/// and the maximum frame size.
#[derive(Debug)]
pub struct DataChannel {
    remaining: usize,
    chunks: Vec<Bytes>,
    written: usize,
    end: Option<Option<HeaderMap>>,
    stream: Option<StreamHandle>,
}

impl DataChannel {
    pub(crate) fn new(capacity: usize, stream: Option<StreamHandle>) -> Self {
        Self {
            remaining: capacity,
            chunks: Vec::new(),
            written: 0,
            end: None,
            stream,
        }
    }

    /// Bytes which may still be written in this round.
    pub fn capacity(&self) -> usize {
        self.remaining
    }

    /// Write as much of `data` as capacity allows, splitting it off the front
    /// of the buffer. Returns the number of bytes accepted.
    pub fn write(&mut self, data: &mut Bytes) -> usize {
        if self.end.is_some() {
            return 0;
        }
        let n = data.len().min(self.remaining);
        if n > 0 {
            self.chunks.push(data.split_to(n));
            self.remaining -= n;
            self.written += n;
        }
        n
    }

    /// Finish the request body, optionally with trailers.
    pub fn end_stream(&mut self, trailers: Option<HeaderMap>) {
        if self.end.is_none() {
            self.end = Some(trailers);
        }
    }

    /// Has the body been finished?
    pub fn is_ended(&self) -> bool {
        self.end.is_some()
    }

    /// Handle for resuming output later, when the exchange runs on a stream.
    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.as_ref()
    }

    pub(crate) fn written(&self) -> usize {
        self.written
    }

    pub(crate) fn into_parts(self) -> (Vec<Bytes>, Option<Option<HeaderMap>>) {
        (self.chunks, self.end)
    }
}

/// Channel through which a handler grants the peer more receive credit.
#[derive(Debug)]
pub struct CapacityChannel {
    consumed: u32,
    granted: u32,
    stream: Option<StreamHandle>,
}

impl CapacityChannel {
    pub(crate) fn new(consumed: u32, stream: Option<StreamHandle>) -> Self {
        Self {
            consumed,
            granted: 0,
            stream,
        }
    }

    /// Bytes delivered to the handler that have not been credited back yet.
    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    /// Credit `increment` bytes back to the peer.
    pub fn update(&mut self, increment: u32) {
        self.granted = self.granted.saturating_add(increment);
    }

    /// Handle for granting credit later, when the exchange runs on a stream.
    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.as_ref()
    }

    pub(crate) fn granted(&self) -> u32 {
        self.granted
    }
}

/// The application side of one request/response exchange.
///
/// Callbacks run on the session's driver task and must not block.
pub trait ExchangeHandler: Send + 'static {
    /// Produce the request head. Called once, before any other callback.
    fn produce_request(&mut self, context: &mut HttpContext) -> Result<RequestHead, Error>;

    /// Number of body bytes ready to be written right now.
    fn available(&self) -> usize {
        0
    }

    /// Write request body data into `channel`.
    ///
    /// A round which writes nothing and does not end the body parks the
    /// stream until [`StreamHandle::request_output`] is called.
    fn produce(&mut self, channel: &mut DataChannel) -> Result<(), Error> {
        channel.end_stream(None);
        Ok(())
    }

    /// An informational (1xx) response arrived.
    fn consume_information(&mut self, response: &http::response::Parts) -> Result<(), Error> {
        let _ = response;
        Ok(())
    }

    /// The final response head arrived. With `end_stream` set there is no
    /// body, and the exchange is complete.
    fn consume_response(
        &mut self,
        response: http::response::Parts,
        end_stream: bool,
    ) -> Result<(), Error>;

    /// Decide how much receive credit to return to the peer. The default
    /// returns everything consumed so far.
    fn update_capacity(&mut self, channel: &mut CapacityChannel) {
        let consumed = channel.consumed();
        channel.update(consumed);
    }

    /// A chunk of the response body arrived.
    fn consume(&mut self, data: Bytes) -> Result<(), Error>;

    /// The response body is complete.
    fn stream_end(&mut self, trailers: Option<HeaderMap>) -> Result<(), Error>;

    /// The exchange was cancelled.
    fn cancel(&mut self);

    /// The exchange failed.
    fn failed(&mut self, error: Error);

    /// The exchange is over; release anything held for it.
    fn release_resources(&mut self);
}

/// Consumer for a response pushed by the server.
pub trait PushConsumer: Send + 'static {
    /// The promised request.
    fn consume_promise(&mut self, request: &http::request::Parts) -> Result<(), Error> {
        let _ = request;
        Ok(())
    }

    /// The pushed response head arrived.
    fn consume_response(
        &mut self,
        response: http::response::Parts,
        end_stream: bool,
    ) -> Result<(), Error>;

    /// Decide how much receive credit to return to the peer.
    fn update_capacity(&mut self, channel: &mut CapacityChannel) {
        let consumed = channel.consumed();
        channel.update(consumed);
    }

    /// A chunk of the pushed body arrived.
    fn consume(&mut self, data: Bytes) -> Result<(), Error>;

    /// The pushed body is complete.
    fn stream_end(&mut self, trailers: Option<HeaderMap>) -> Result<(), Error>;

    /// The push failed or was cancelled.
    fn failed(&mut self, error: Error);

    /// The push is over.
    fn release_resources(&mut self) {}
}

/// Creates consumers for server pushes.
pub trait PushHandlerFactory: Send + Sync + 'static {
    /// Create a consumer for the promised `request`, or `None` to refuse the
    /// push.
    fn create(&self, request: &http::request::Parts) -> Option<Box<dyn PushConsumer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_channel_bounds_writes() {
        let mut channel = DataChannel::new(4, None);
        let mut data = Bytes::from_static(b"hello world");

        assert_eq!(channel.write(&mut data), 4);
        assert_eq!(data, Bytes::from_static(b"o world"));
        assert_eq!(channel.capacity(), 0);
        assert_eq!(channel.write(&mut data), 0);
        assert_eq!(channel.written(), 4);

        channel.end_stream(None);
        assert!(channel.is_ended());
        let (chunks, end) = channel.into_parts();
        assert_eq!(chunks, vec![Bytes::from_static(b"hell")]);
        assert!(matches!(end, Some(None)));
    }

    #[test]
    fn data_channel_refuses_after_end() {
        let mut channel = DataChannel::new(16, None);
        channel.end_stream(None);
        let mut data = Bytes::from_static(b"late");
        assert_eq!(channel.write(&mut data), 0);
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn capacity_channel_grants() {
        let mut channel = CapacityChannel::new(100, None);
        assert_eq!(channel.consumed(), 100);
        channel.update(40);
        channel.update(10);
        assert_eq!(channel.granted(), 50);
    }

    #[test]
    fn stream_handle_without_session() {
        let queue = Arc::new(CommandQueue::new());
        let handle = StreamHandle::new(StreamId::new(3), &queue);
        assert!(handle.request_output());
        assert!(handle.update_capacity(10));
        assert!(!handle.update_capacity(0));
        assert!(Cancellable::cancel(&handle));
        assert_eq!(queue.len(), 3);
        assert!(matches!(queue.try_pop(), Some(Command::CancelStream(_))));

        drop(queue);
        assert!(!handle.request_output());
    }

    #[test]
    fn context_policy_override() {
        let context = HttpContext::new().with_version_policy(VersionPolicy::ForceHttp2);
        assert_eq!(context.version_policy(), Some(VersionPolicy::ForceHttp2));
        assert_eq!(context.stream_id(), None);
    }
}
