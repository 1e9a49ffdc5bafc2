//! The stream multiplexer behind an HTTP/2 session.
//!
//! [`Multiplexer`] performs no I/O. The session driver feeds it received
//! frames and queued [`Command`]s, and pulls frames to write with
//! [`Multiplexer::poll_output`]. Request body data is only pulled from
//! handlers when a frame is wanted and both the stream and the connection
//! send windows have room, so a slow peer stalls handlers instead of
//! buffering their output.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::{fmt, io, mem};

use bytes::{Bytes, BytesMut};

use super::flow::{FlowControl, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use super::frame::{Frame, HeaderBlock, Reason, Settings, StreamId};
use super::listener::FrameListener;
use super::stream::{H2Stream, Outcome, StreamState};
use super::{Config, SubmissionPolicy};
use crate::cancel::Cancellable;
use crate::exchange::{CapacityChannel, DataChannel, StreamHandle};
use crate::session::{CloseMode, Command, CommandQueue, ExecutableCommand, Priority, SessionId};
use crate::{Error, ErrorKind};

const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;

/// A violation which ends the whole connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct ConnectionError {
    reason: Reason,
    message: String,
}

impl ConnectionError {
    /// Create a connection error.
    pub fn new<S: Into<String>>(reason: Reason, message: S) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    fn protocol<S: Into<String>>(message: S) -> Self {
        Self::new(Reason::PROTOCOL_ERROR, message)
    }

    fn flow_control<S: Into<String>>(message: S) -> Self {
        Self::new(Reason::FLOW_CONTROL_ERROR, message)
    }

    /// The GOAWAY error code.
    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// Diagnostic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Draining,
    Closed,
}

#[derive(Debug)]
struct PeerSettings {
    initial_window_size: u32,
    max_concurrent_streams: Option<u32>,
    max_frame_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_concurrent_streams: None,
            max_frame_size: MIN_FRAME_SIZE,
        }
    }
}

/// Cancels a submission waiting in the pending queue.
struct PendingCancel {
    queue: Weak<CommandQueue>,
}

impl Cancellable for PendingCancel {
    fn cancel(&self) -> bool {
        match self.queue.upgrade() {
            Some(queue) => queue.push(Command::SweepPending, Priority::Immediate).is_ok(),
            None => false,
        }
    }
}

fn reason_for(error: &Error) -> Reason {
    match error.kind() {
        ErrorKind::Protocol => Reason::PROTOCOL_ERROR,
        ErrorKind::Cancelled => Reason::CANCEL,
        _ => Reason::INTERNAL_ERROR,
    }
}

fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.pop().unwrap_or_default(),
        _ => {
            let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        }
    }
}

/// HTTP/2 client protocol engine for one connection.
pub struct Multiplexer {
    id: SessionId,
    config: Config,
    queue: Arc<CommandQueue>,
    listener: Option<Arc<dyn FrameListener>>,

    state: State,
    peer: PeerSettings,
    goaway_sent: bool,

    next_stream_id: Option<StreamId>,
    last_push_id: StreamId,
    streams: BTreeMap<StreamId, H2Stream>,
    local_streams: usize,

    send_flow: FlowControl,
    recv_flow: FlowControl,
    recv_target: u32,
    recv_unacked: u32,

    pending: VecDeque<ExecutableCommand>,
    ready: VecDeque<StreamId>,
    outbound: VecDeque<Frame>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .field("pending", &self.pending.len())
            .field("send_window", &self.send_flow.window())
            .finish()
    }
}

impl Multiplexer {
    /// Create the engine for a fresh connection. The connection preface
    /// SETTINGS (and a connection WINDOW_UPDATE, if the configured connection
    /// window is larger than the protocol default) are queued for output.
    ///
    /// `queue` is the session's command queue; stream handles given to
    /// handlers push their commands onto it.
    pub fn new(
        id: SessionId,
        config: Config,
        queue: Arc<CommandQueue>,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> Self {
        let mut outbound = VecDeque::new();
        outbound.push_back(Frame::Settings {
            ack: false,
            settings: config.local_settings(),
        });

        let recv_target = config
            .connection_window_size
            .clamp(DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE);
        if recv_target > DEFAULT_WINDOW_SIZE {
            outbound.push_back(Frame::WindowUpdate {
                stream_id: StreamId::ZERO,
                increment: recv_target - DEFAULT_WINDOW_SIZE,
            });
        }

        Self {
            id,
            config,
            queue,
            listener,
            state: State::Open,
            peer: PeerSettings::default(),
            goaway_sent: false,
            next_stream_id: Some(StreamId::FIRST_CLIENT),
            last_push_id: StreamId::ZERO,
            streams: BTreeMap::new(),
            local_streams: 0,
            send_flow: FlowControl::default(),
            recv_flow: FlowControl::new(recv_target),
            recv_target,
            recv_unacked: 0,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            outbound,
        }
    }

    /// The session this engine belongs to.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Accepting new exchanges?
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Finished: no streams remain and no new ones will be opened. Queued
    /// output should still be flushed before the transport is closed.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Client-initiated streams currently open.
    pub fn active_streams(&self) -> usize {
        self.local_streams
    }

    /// Submissions waiting for a free stream slot.
    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    /// The effective concurrency cap: the smaller of the local configuration
    /// and the peer's advertised limit.
    pub fn max_concurrent_streams(&self) -> u32 {
        self.config
            .max_concurrent_streams
            .min(self.peer.max_concurrent_streams.unwrap_or(u32::MAX))
    }

    /// The connection send window.
    pub fn send_window(&self) -> i64 {
        self.send_flow.window()
    }

    /// State of a live stream.
    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id).map(|stream| stream.state)
    }

    /// Send window of a live stream.
    pub fn stream_send_window(&self, id: StreamId) -> Option<i64> {
        self.streams.get(&id).map(|stream| stream.send_flow.window())
    }

    /// Next frame to write. When no control frames are queued, request body
    /// data is produced from streams which are ready to send.
    pub fn poll_output(&mut self) -> Option<Frame> {
        if self.outbound.is_empty() && self.state != State::Closed {
            self.produce_output();
        }
        let frame = self.outbound.pop_front()?;
        if let Some(listener) = &self.listener {
            listener.on_frame_output(self.id, &frame);
        }
        Some(frame)
    }

    /// Execute a command popped from the session queue.
    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Execute(command) => self.submit(*command),
            Command::Shutdown(mode) => self.shutdown(mode),
            Command::CancelStream(id) => self.cancel_stream(id),
            Command::RequestOutput(id) => self.schedule(id),
            Command::UpdateCapacity(id, increment) => self.grant(id, increment),
            Command::SweepPending => self.sweep_pending(),
        }
    }

    /// Submit an exchange.
    ///
    /// At the concurrency cap the exchange is failed with
    /// [`Error::Rejected`] or queued, depending on the
    /// [`SubmissionPolicy`]. Queued exchanges start in submission order as
    /// streams close.
    pub fn submit(&mut self, command: ExecutableCommand) {
        if self.state != State::Open {
            command.fail(Error::ConnectionClosed);
            return;
        }
        if command.cancellable.is_cancelled() {
            command.cancel();
            return;
        }

        let max = self.max_concurrent_streams();
        let saturated = self.local_streams >= max as usize;
        match self.config.submission_policy {
            SubmissionPolicy::Reject if saturated => {
                tracing::debug!(session = %self.id, max, "rejecting exchange at stream limit");
                command.fail(Error::Rejected {
                    max_concurrent_streams: max,
                });
            }
            SubmissionPolicy::Queue if saturated || !self.pending.is_empty() => {
                tracing::trace!(session = %self.id, pending = self.pending.len(), "queueing exchange");
                command.cancellable.set_dependency(Box::new(PendingCancel {
                    queue: Arc::downgrade(&self.queue),
                }));
                self.pending.push_back(command);
            }
            _ => self.open_stream(command),
        }
    }

    fn open_stream(&mut self, command: ExecutableCommand) {
        let ExecutableCommand {
            mut handler,
            push_factory,
            cancellable,
            mut context,
        } = command;

        let Some(id) = self.next_stream_id else {
            tracing::debug!(session = %self.id, "stream identifiers exhausted");
            handler.failed(Error::ConnectionClosed);
            handler.release_resources();
            self.shutdown(CloseMode::Graceful);
            return;
        };

        context.set_stream_id(id);
        let block = match handler
            .produce_request(&mut context)
            .and_then(|head| Ok((HeaderBlock::request(&head.parts)?, head.has_body)))
        {
            Ok(block) => block,
            Err(error) => {
                tracing::debug!(session = %self.id, %error, "request head failed");
                handler.failed(error);
                handler.release_resources();
                return;
            }
        };
        let (block, has_body) = block;

        self.next_stream_id = id.next();
        self.outbound.push_back(Frame::Headers {
            stream_id: id,
            block,
            end_stream: !has_body,
        });

        let handle = StreamHandle::new(id, &self.queue);
        let mut stream = H2Stream::local(
            handle.clone(),
            handler,
            push_factory,
            self.peer.initial_window_size,
            self.config.initial_window_size,
        );
        if !has_body {
            stream.state = stream.state.send_end();
        } else {
            stream.queued = true;
            self.ready.push_back(id);
        }
        self.streams.insert(id, stream);
        self.local_streams += 1;
        tracing::debug!(session = %self.id, stream = %id, "stream opened");

        cancellable.set_dependency(Box::new(handle));
    }

    fn service_pending(&mut self) {
        while self.state == State::Open
            && self.local_streams < self.max_concurrent_streams() as usize
        {
            let Some(command) = self.pending.pop_front() else {
                break;
            };
            if command.cancellable.is_cancelled() {
                command.cancel();
                continue;
            }
            self.open_stream(command);
        }
    }

    fn sweep_pending(&mut self) {
        let (cancelled, pending) = mem::take(&mut self.pending)
            .into_iter()
            .partition::<Vec<_>, _>(|command| command.cancellable.is_cancelled());
        self.pending = pending.into();
        for command in cancelled {
            tracing::trace!(session = %self.id, "dropping cancelled submission");
            command.cancel();
        }
    }

    fn drain_pending(&mut self) {
        for command in mem::take(&mut self.pending) {
            command.fail(Error::ConnectionClosed);
        }
    }

    fn schedule(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if !stream.queued && stream.state.can_send() {
                stream.queued = true;
                stream.blocked = false;
                self.ready.push_back(id);
            }
        }
    }

    fn unblock_streams(&mut self) {
        let blocked: Vec<StreamId> = self
            .streams
            .values()
            .filter(|stream| stream.blocked)
            .map(|stream| stream.id)
            .collect();
        for id in blocked {
            self.schedule(id);
        }
    }

    fn produce_output(&mut self) {
        let mut round = self.ready.len();
        while round > 0 && self.outbound.is_empty() {
            round -= 1;
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            self.produce_stream(id);
        }
    }

    fn produce_stream(&mut self, id: StreamId) {
        let connection_available = self.send_flow.available();
        let max_frame_size = self.peer.max_frame_size;
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.queued = false;
        if !stream.state.can_send() {
            return;
        }

        let capacity = stream
            .send_flow
            .available()
            .min(connection_available)
            .min(max_frame_size);
        if capacity == 0 {
            tracing::trace!(session = %self.id, stream = %id, available = stream.available(), "blocked on flow control");
            stream.blocked = true;
            return;
        }

        let mut channel = DataChannel::new(capacity as usize, Some(stream.handle()));
        if let Err(error) = stream.produce(&mut channel) {
            self.reset_stream(id, reason_for(&error), Outcome::Failed(error));
            return;
        }

        let written = u32::try_from(channel.written()).unwrap_or(capacity).min(capacity);
        let (chunks, end) = channel.into_parts();
        if written > 0 {
            // `written` never exceeds either window.
            let _ = stream.send_flow.consume(written);
            let _ = self.send_flow.consume(written);
            if let Some(listener) = &self.listener {
                let delta = -i64::from(written);
                listener.on_output_flow_control(self.id, id, delta, stream.send_flow.window());
                listener.on_output_flow_control(self.id, StreamId::ZERO, delta, self.send_flow.window());
            }
        }

        let payload = concat(chunks);
        match end {
            None if written == 0 => {
                tracing::trace!(session = %self.id, stream = %id, "no output, parked");
            }
            None => {
                stream.queued = true;
                self.ready.push_back(id);
                self.outbound.push_back(Frame::Data {
                    stream_id: id,
                    payload,
                    end_stream: false,
                });
            }
            Some(None) => {
                self.outbound.push_back(Frame::Data {
                    stream_id: id,
                    payload,
                    end_stream: true,
                });
                self.local_end(id);
            }
            Some(Some(trailers)) => {
                if written > 0 {
                    self.outbound.push_back(Frame::Data {
                        stream_id: id,
                        payload,
                        end_stream: false,
                    });
                }
                self.outbound.push_back(Frame::Headers {
                    stream_id: id,
                    block: HeaderBlock::trailers(trailers),
                    end_stream: true,
                });
                self.local_end(id);
            }
        }
    }

    fn local_end(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.state = stream.state.send_end();
            if stream.state.is_closed() {
                self.complete_stream(id);
            }
        }
    }

    fn remote_end(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.state = stream.state.recv_end();
            if stream.state.is_closed() {
                self.complete_stream(id);
            }
        }
    }

    fn remove_stream(&mut self, id: StreamId) -> Option<H2Stream> {
        let stream = self.streams.remove(&id)?;
        if stream.is_local() {
            self.local_streams -= 1;
        }
        Some(stream)
    }

    fn stream_closed(&mut self) {
        self.service_pending();
        if self.state == State::Draining && self.streams.is_empty() {
            tracing::debug!(session = %self.id, "drained");
            self.state = State::Closed;
        }
    }

    fn complete_stream(&mut self, id: StreamId) {
        if let Some(stream) = self.remove_stream(id) {
            stream.close(Outcome::Completed);
            self.stream_closed();
        }
    }

    fn reset_stream(&mut self, id: StreamId, reason: Reason, outcome: Outcome) {
        if let Some(stream) = self.remove_stream(id) {
            tracing::debug!(session = %self.id, stream = %id, %reason, "resetting stream");
            self.outbound.push_back(Frame::Reset {
                stream_id: id,
                reason,
            });
            stream.close(outcome);
            self.stream_closed();
        }
    }

    fn cancel_stream(&mut self, id: StreamId) {
        self.reset_stream(id, Reason::CANCEL, Outcome::Cancelled);
    }

    fn fail_streams(&mut self, error: &Error) {
        self.local_streams = 0;
        self.ready.clear();
        for (_, stream) in mem::take(&mut self.streams) {
            stream.close(Outcome::Failed(error.clone()));
        }
    }

    fn send_goaway(&mut self, reason: Reason, debug_data: Bytes) {
        if !self.goaway_sent {
            self.goaway_sent = true;
            self.outbound.push_back(Frame::GoAway {
                last_stream_id: self.last_push_id,
                reason,
                debug_data,
            });
        }
    }

    /// Close the connection. A graceful shutdown stops accepting work and
    /// lets open streams finish; an immediate one fails them.
    pub fn shutdown(&mut self, mode: CloseMode) {
        tracing::debug!(session = %self.id, ?mode, "shutdown");
        self.send_goaway(Reason::NO_ERROR, Bytes::new());
        self.drain_pending();
        match mode {
            CloseMode::Graceful => {
                if self.state == State::Open {
                    self.state = State::Draining;
                }
                if self.streams.is_empty() {
                    self.state = State::Closed;
                }
            }
            CloseMode::Immediate => {
                self.state = State::Closed;
                self.fail_streams(&Error::ConnectionClosed);
            }
        }
    }

    /// Tear down after a connection-level protocol violation: GOAWAY with the
    /// error's code and every stream failed.
    pub fn connection_error(&mut self, error: ConnectionError) {
        tracing::warn!(session = %self.id, %error, "connection error");
        self.send_goaway(error.reason, Bytes::from(error.message.clone()));
        self.state = State::Closed;
        self.fail_streams(&Error::protocol(error.to_string()));
        self.drain_pending();
    }

    /// The transport is gone. Every stream and pending submission fails.
    pub fn disconnected(&mut self, cause: Option<io::Error>) {
        if self.state != State::Closed {
            tracing::debug!(session = %self.id, cause = ?cause, "disconnected");
        }
        self.state = State::Closed;
        self.outbound.clear();
        let error = cause.map_or(Error::ConnectionClosed, Error::transport);
        self.fail_streams(&error);
        self.drain_pending();
    }

    /// Process a received frame.
    ///
    /// Stream-level problems reset the affected stream. A connection-level
    /// problem is returned; pass it to
    /// [`connection_error`](Multiplexer::connection_error).
    pub fn recv_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if let Some(listener) = &self.listener {
            listener.on_frame_input(self.id, &frame);
        }
        if self.state == State::Closed {
            tracing::trace!(session = %self.id, frame = frame.kind(), "ignoring frame on closed session");
            return Ok(());
        }

        match frame {
            Frame::Headers {
                stream_id,
                block,
                end_stream,
            } => self.recv_headers(stream_id, block, end_stream),
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => self.recv_data(stream_id, payload, end_stream),
            Frame::Reset { stream_id, reason } => self.recv_reset(stream_id, reason),
            Frame::Settings { ack, settings } => self.recv_settings(ack, settings),
            Frame::PushPromise {
                stream_id,
                promised_id,
                block,
            } => self.recv_push_promise(stream_id, promised_id, block),
            Frame::Ping { ack, payload } => {
                if !ack {
                    self.outbound.push_back(Frame::Ping { ack: true, payload });
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                reason,
                debug_data,
            } => {
                self.recv_goaway(last_stream_id, reason, debug_data);
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.recv_window_update(stream_id, increment),
        }
    }

    fn unknown_stream(&self, id: StreamId, kind: &str) -> Result<(), ConnectionError> {
        let idle = if id.is_client_initiated() {
            self.next_stream_id.is_some_and(|next| id >= next)
        } else {
            id > self.last_push_id
        };
        if idle {
            return Err(ConnectionError::protocol(format!(
                "{kind} on idle stream {id}"
            )));
        }
        tracing::trace!(session = %self.id, stream = %id, "{kind} on closed stream ignored");
        Ok(())
    }

    fn recv_headers(
        &mut self,
        id: StreamId,
        block: HeaderBlock,
        end_stream: bool,
    ) -> Result<(), ConnectionError> {
        if id.is_zero() {
            return Err(ConnectionError::protocol("HEADERS on stream 0"));
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return self.unknown_stream(id, "HEADERS");
        };
        if !stream.state.can_recv() {
            self.reset_stream(
                id,
                Reason::STREAM_CLOSED,
                Outcome::Failed(Error::protocol("HEADERS after end of stream")),
            );
            return Ok(());
        }

        let result = if stream.response_received {
            if end_stream {
                stream.stream_end(Some(block.fields))
            } else {
                Err(Error::protocol("trailers without END_STREAM"))
            }
        } else {
            match block.into_response() {
                Ok(response) if response.status.is_informational() => {
                    if end_stream {
                        Err(Error::protocol("informational response ends stream"))
                    } else {
                        stream.consume_information(&response)
                    }
                }
                Ok(response) => stream.consume_response(response, end_stream),
                Err(error) => Err(error),
            }
        };

        match result {
            Ok(()) if end_stream => self.remote_end(id),
            Ok(()) => {}
            Err(error) => self.reset_stream(id, reason_for(&error), Outcome::Failed(error)),
        }
        Ok(())
    }

    fn recv_data(
        &mut self,
        id: StreamId,
        payload: Bytes,
        end_stream: bool,
    ) -> Result<(), ConnectionError> {
        if id.is_zero() {
            return Err(ConnectionError::protocol("DATA on stream 0"));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| ConnectionError::new(Reason::FRAME_SIZE_ERROR, "oversized DATA frame"))?;

        self.recv_flow
            .consume(len)
            .map_err(|_| ConnectionError::flow_control("connection receive window exceeded"))?;
        if let Some(listener) = &self.listener {
            listener.on_input_flow_control(self.id, StreamId::ZERO, -i64::from(len), self.recv_flow.window());
        }
        self.release_connection_window(len);

        let Some(stream) = self.streams.get_mut(&id) else {
            return self.unknown_stream(id, "DATA");
        };
        if !stream.state.can_recv() {
            self.reset_stream(
                id,
                Reason::STREAM_CLOSED,
                Outcome::Failed(Error::protocol("DATA after end of stream")),
            );
            return Ok(());
        }
        if stream.recv_flow.consume(len).is_err() {
            self.reset_stream(
                id,
                Reason::FLOW_CONTROL_ERROR,
                Outcome::Failed(Error::protocol("stream receive window exceeded")),
            );
            return Ok(());
        }
        if !stream.response_received {
            self.reset_stream(
                id,
                Reason::PROTOCOL_ERROR,
                Outcome::Failed(Error::protocol("DATA before response headers")),
            );
            return Ok(());
        }

        let mut result = Ok(());
        if len > 0 {
            stream.unacked = stream.unacked.saturating_add(len);
            result = stream.consume(payload);
        }
        if result.is_ok() && end_stream {
            result = stream.stream_end(None);
        }

        match result {
            Err(error) => self.reset_stream(id, reason_for(&error), Outcome::Failed(error)),
            Ok(()) if end_stream => self.remote_end(id),
            Ok(()) if len > 0 => self.update_capacity(id),
            Ok(()) => {}
        }
        Ok(())
    }

    fn release_connection_window(&mut self, len: u32) {
        self.recv_unacked = self.recv_unacked.saturating_add(len);
        if self.recv_unacked >= self.recv_target / 2 {
            let increment = mem::take(&mut self.recv_unacked);
            if self.recv_flow.increase(increment).is_ok() {
                self.outbound.push_back(Frame::WindowUpdate {
                    stream_id: StreamId::ZERO,
                    increment,
                });
                if let Some(listener) = &self.listener {
                    listener.on_input_flow_control(
                        self.id,
                        StreamId::ZERO,
                        i64::from(increment),
                        self.recv_flow.window(),
                    );
                }
            }
        }
    }

    fn update_capacity(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        let mut channel = CapacityChannel::new(stream.unacked, Some(stream.handle()));
        stream.update_capacity(&mut channel);
        self.grant(id, channel.granted());
    }

    fn grant(&mut self, id: StreamId, increment: u32) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if !stream.state.can_recv() {
            return;
        }
        let room = u32::try_from(i64::from(MAX_WINDOW_SIZE) - stream.recv_flow.window()).unwrap_or(0);
        let increment = increment.min(room);
        if increment == 0 {
            return;
        }
        stream.unacked = stream.unacked.saturating_sub(increment);
        if stream.recv_flow.increase(increment).is_ok() {
            if let Some(listener) = &self.listener {
                listener.on_input_flow_control(self.id, id, i64::from(increment), stream.recv_flow.window());
            }
            self.outbound.push_back(Frame::WindowUpdate {
                stream_id: id,
                increment,
            });
        }
    }

    fn recv_reset(&mut self, id: StreamId, reason: Reason) -> Result<(), ConnectionError> {
        if id.is_zero() {
            return Err(ConnectionError::protocol("RST_STREAM on stream 0"));
        }
        match self.remove_stream(id) {
            Some(stream) => {
                tracing::debug!(session = %self.id, stream = %id, %reason, "stream reset by peer");
                stream.close(Outcome::Failed(Error::StreamReset(reason)));
                self.stream_closed();
                Ok(())
            }
            None => self.unknown_stream(id, "RST_STREAM"),
        }
    }

    fn recv_settings(&mut self, ack: bool, settings: Settings) -> Result<(), ConnectionError> {
        if ack {
            tracing::trace!(session = %self.id, "settings acknowledged");
            return Ok(());
        }

        if settings.enable_push == Some(true) {
            return Err(ConnectionError::protocol("server enabled push"));
        }

        if let Some(size) = settings.max_frame_size {
            if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
                return Err(ConnectionError::protocol(format!(
                    "invalid max frame size {size}"
                )));
            }
            self.peer.max_frame_size = size;
        }

        if let Some(max) = settings.max_concurrent_streams {
            tracing::debug!(session = %self.id, max, "peer stream limit");
            self.peer.max_concurrent_streams = Some(max);
        }

        if let Some(size) = settings.initial_window_size {
            if size > MAX_WINDOW_SIZE {
                return Err(ConnectionError::flow_control(format!(
                    "initial window size {size} too large"
                )));
            }
            let delta = i64::from(size) - i64::from(self.peer.initial_window_size);
            self.peer.initial_window_size = size;
            for stream in self.streams.values_mut() {
                stream.send_flow.adjust(delta).map_err(|_| {
                    ConnectionError::flow_control("initial window change overflows a stream window")
                })?;
                if let Some(listener) = &self.listener {
                    listener.on_output_flow_control(self.id, stream.id, delta, stream.send_flow.window());
                }
            }
            if delta > 0 {
                self.unblock_streams();
            }
        }

        self.outbound.push_back(Frame::Settings {
            ack: true,
            settings: Settings::default(),
        });
        self.service_pending();
        Ok(())
    }

    fn recv_window_update(&mut self, id: StreamId, increment: u32) -> Result<(), ConnectionError> {
        if increment == 0 {
            if id.is_zero() {
                return Err(ConnectionError::protocol("zero connection window increment"));
            }
            self.reset_stream(
                id,
                Reason::PROTOCOL_ERROR,
                Outcome::Failed(Error::protocol("zero window increment")),
            );
            return Ok(());
        }

        if id.is_zero() {
            self.send_flow
                .increase(increment)
                .map_err(|_| ConnectionError::flow_control("connection send window overflow"))?;
            if let Some(listener) = &self.listener {
                listener.on_output_flow_control(self.id, id, i64::from(increment), self.send_flow.window());
            }
            self.unblock_streams();
            return Ok(());
        }

        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if stream.send_flow.increase(increment).is_err() {
            self.reset_stream(
                id,
                Reason::FLOW_CONTROL_ERROR,
                Outcome::Failed(Error::protocol("stream send window overflow")),
            );
            return Ok(());
        }
        if let Some(listener) = &self.listener {
            listener.on_output_flow_control(self.id, id, i64::from(increment), stream.send_flow.window());
        }
        if stream.blocked {
            self.schedule(id);
        }
        Ok(())
    }

    fn recv_push_promise(
        &mut self,
        id: StreamId,
        promised: StreamId,
        block: HeaderBlock,
    ) -> Result<(), ConnectionError> {
        if !self.config.push_enabled {
            return Err(ConnectionError::protocol("PUSH_PROMISE with push disabled"));
        }
        if !promised.is_server_initiated() || promised <= self.last_push_id {
            return Err(ConnectionError::protocol(format!(
                "invalid promised stream {promised}"
            )));
        }
        self.last_push_id = promised;

        let factory = match self.streams.get(&id) {
            Some(stream) if stream.is_local() && stream.state.can_recv() => stream.push_factory(),
            Some(_) => None,
            None => {
                self.unknown_stream(id, "PUSH_PROMISE")?;
                None
            }
        };

        let request = match block.into_request() {
            Ok(request) => request,
            Err(error) => {
                tracing::debug!(session = %self.id, stream = %promised, %error, "malformed push promise");
                self.outbound.push_back(Frame::Reset {
                    stream_id: promised,
                    reason: Reason::PROTOCOL_ERROR,
                });
                return Ok(());
            }
        };

        let Some(mut consumer) = factory.and_then(|factory| factory.create(&request)) else {
            tracing::debug!(session = %self.id, stream = %promised, uri = %request.uri, "refusing push");
            self.outbound.push_back(Frame::Reset {
                stream_id: promised,
                reason: Reason::REFUSED_STREAM,
            });
            return Ok(());
        };

        if let Err(error) = consumer.consume_promise(&request) {
            consumer.failed(error);
            consumer.release_resources();
            self.outbound.push_back(Frame::Reset {
                stream_id: promised,
                reason: Reason::CANCEL,
            });
            return Ok(());
        }

        tracing::debug!(session = %self.id, stream = %promised, uri = %request.uri, "accepted push");
        let stream = H2Stream::pushed(
            StreamHandle::new(promised, &self.queue),
            consumer,
            self.peer.initial_window_size,
            self.config.initial_window_size,
        );
        self.streams.insert(promised, stream);
        Ok(())
    }

    fn recv_goaway(&mut self, last_stream_id: StreamId, reason: Reason, debug_data: Bytes) {
        tracing::debug!(
            session = %self.id,
            last_stream = %last_stream_id,
            %reason,
            debug = %String::from_utf8_lossy(&debug_data),
            "GOAWAY received"
        );
        if self.state == State::Open {
            self.state = State::Draining;
        }

        let refused: Vec<StreamId> = self
            .streams
            .keys()
            .filter(|id| id.is_client_initiated() && **id > last_stream_id)
            .copied()
            .collect();
        for id in refused {
            if let Some(stream) = self.remove_stream(id) {
                stream.close(Outcome::Failed(Error::GoAway(reason)));
            }
        }

        self.drain_pending();
        self.stream_closed();
    }
}
