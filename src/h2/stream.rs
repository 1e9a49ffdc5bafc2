//! Per-stream state.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use super::flow::FlowControl;
use super::frame::StreamId;
use crate::exchange::{
    CapacityChannel, DataChannel, ExchangeHandler, PushConsumer, PushHandlerFactory, StreamHandle,
};
use crate::Error;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not yet opened.
    Idle,
    /// Headers sent, both directions open.
    Open,
    /// We finished sending; the response is still arriving.
    HalfClosedLocal,
    /// The peer finished sending; our body is still going out.
    HalfClosedRemote,
    /// Both directions finished, or the stream was reset.
    Closed,
}

impl StreamState {
    /// State after we send END_STREAM.
    pub fn send_end(self) -> Self {
        match self {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedLocal => StreamState::HalfClosedLocal,
        }
    }

    /// State after the peer sends END_STREAM.
    pub fn recv_end(self) -> Self {
        match self {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedRemote => StreamState::HalfClosedRemote,
        }
    }

    /// May we still send on this stream?
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// May the peer still send on this stream?
    pub fn can_recv(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Is the stream finished?
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// How a stream ended, from its handler's point of view.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The handler already saw the end of the response.
    Completed,
    Failed(Error),
    Cancelled,
}

enum Exchange {
    Local {
        handler: Box<dyn ExchangeHandler>,
        push_factory: Option<Arc<dyn PushHandlerFactory>>,
    },
    Push(Box<dyn PushConsumer>),
}

/// A stream and the handler bound to it.
pub(crate) struct H2Stream {
    pub(crate) id: StreamId,
    pub(crate) state: StreamState,
    pub(crate) send_flow: FlowControl,
    pub(crate) recv_flow: FlowControl,

    /// The final response head has been delivered.
    pub(crate) response_received: bool,

    /// Bytes delivered to the handler and not yet credited back to the peer.
    pub(crate) unacked: u32,

    /// In the ready queue.
    pub(crate) queued: bool,

    /// Waiting for a flow-control window to open.
    pub(crate) blocked: bool,

    handle: StreamHandle,
    exchange: Exchange,
}

impl fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Stream")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("send_window", &self.send_flow.window())
            .field("recv_window", &self.recv_flow.window())
            .field("push", &matches!(self.exchange, Exchange::Push(_)))
            .finish()
    }
}

impl H2Stream {
    pub(crate) fn local(
        handle: StreamHandle,
        handler: Box<dyn ExchangeHandler>,
        push_factory: Option<Arc<dyn PushHandlerFactory>>,
        send_window: u32,
        recv_window: u32,
    ) -> Self {
        Self::new(
            handle,
            Exchange::Local {
                handler,
                push_factory,
            },
            StreamState::Open,
            send_window,
            recv_window,
        )
    }

    pub(crate) fn pushed(
        handle: StreamHandle,
        consumer: Box<dyn PushConsumer>,
        send_window: u32,
        recv_window: u32,
    ) -> Self {
        Self::new(
            handle,
            Exchange::Push(consumer),
            StreamState::HalfClosedLocal,
            send_window,
            recv_window,
        )
    }

    fn new(
        handle: StreamHandle,
        exchange: Exchange,
        state: StreamState,
        send_window: u32,
        recv_window: u32,
    ) -> Self {
        Self {
            id: handle.id(),
            state,
            send_flow: FlowControl::new(send_window),
            recv_flow: FlowControl::new(recv_window),
            response_received: false,
            unacked: 0,
            queued: false,
            blocked: false,
            handle,
            exchange,
        }
    }

    /// Client-initiated streams count against the concurrency cap.
    pub(crate) fn is_local(&self) -> bool {
        matches!(self.exchange, Exchange::Local { .. })
    }

    pub(crate) fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub(crate) fn push_factory(&self) -> Option<Arc<dyn PushHandlerFactory>> {
        match &self.exchange {
            Exchange::Local { push_factory, .. } => push_factory.clone(),
            Exchange::Push(_) => None,
        }
    }

    pub(crate) fn available(&self) -> usize {
        match &self.exchange {
            Exchange::Local { handler, .. } => handler.available(),
            Exchange::Push(_) => 0,
        }
    }

    pub(crate) fn produce(&mut self, channel: &mut DataChannel) -> Result<(), Error> {
        match &mut self.exchange {
            Exchange::Local { handler, .. } => handler.produce(channel),
            Exchange::Push(_) => {
                channel.end_stream(None);
                Ok(())
            }
        }
    }

    pub(crate) fn consume_information(
        &mut self,
        response: &http::response::Parts,
    ) -> Result<(), Error> {
        match &mut self.exchange {
            Exchange::Local { handler, .. } => handler.consume_information(response),
            Exchange::Push(_) => Ok(()),
        }
    }

    pub(crate) fn consume_response(
        &mut self,
        response: http::response::Parts,
        end_stream: bool,
    ) -> Result<(), Error> {
        self.response_received = true;
        match &mut self.exchange {
            Exchange::Local { handler, .. } => handler.consume_response(response, end_stream),
            Exchange::Push(consumer) => consumer.consume_response(response, end_stream),
        }
    }

    pub(crate) fn consume(&mut self, data: Bytes) -> Result<(), Error> {
        match &mut self.exchange {
            Exchange::Local { handler, .. } => handler.consume(data),
            Exchange::Push(consumer) => consumer.consume(data),
        }
    }

    pub(crate) fn update_capacity(&mut self, channel: &mut CapacityChannel) {
        match &mut self.exchange {
            Exchange::Local { handler, .. } => handler.update_capacity(channel),
            Exchange::Push(consumer) => consumer.update_capacity(channel),
        }
    }

    pub(crate) fn stream_end(&mut self, trailers: Option<HeaderMap>) -> Result<(), Error> {
        match &mut self.exchange {
            Exchange::Local { handler, .. } => handler.stream_end(trailers),
            Exchange::Push(consumer) => consumer.stream_end(trailers),
        }
    }

    /// Notify the handler how the stream ended and release it. Consuming the
    /// stream makes this happen exactly once.
    pub(crate) fn close(mut self, outcome: Outcome) {
        self.state = StreamState::Closed;
        tracing::trace!(stream = %self.id, ?outcome, "stream closed");
        match &mut self.exchange {
            Exchange::Local { handler, .. } => {
                match outcome {
                    Outcome::Completed => {}
                    Outcome::Failed(error) => handler.failed(error),
                    Outcome::Cancelled => handler.cancel(),
                }
                handler.release_resources();
            }
            Exchange::Push(consumer) => {
                match outcome {
                    Outcome::Completed => {}
                    Outcome::Failed(error) => consumer.failed(error),
                    Outcome::Cancelled => consumer.failed(Error::Cancelled),
                }
                consumer.release_resources();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_lifecycle() {
        let state = StreamState::Open;
        assert!(state.can_send() && state.can_recv());

        let state = state.send_end();
        assert_eq!(state, StreamState::HalfClosedLocal);
        assert!(!state.can_send());
        assert!(state.can_recv());

        let state = state.recv_end();
        assert_eq!(state, StreamState::Closed);
        assert!(state.is_closed());
    }

    #[test]
    fn response_before_request_body_finishes() {
        let state = StreamState::Open.recv_end();
        assert_eq!(state, StreamState::HalfClosedRemote);
        assert!(state.can_send());
        assert!(!state.can_recv());
        assert_eq!(state.send_end(), StreamState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        assert_eq!(StreamState::Closed.send_end(), StreamState::Closed);
        assert_eq!(StreamState::Closed.recv_end(), StreamState::Closed);
    }
}
