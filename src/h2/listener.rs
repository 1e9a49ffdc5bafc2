//! Observation hooks for frame traffic and flow-control changes.

use super::frame::{Frame, StreamId};
use crate::session::SessionId;

/// Observes an HTTP/2 session. All methods default to doing nothing.
///
/// Listeners are called from the session's driver task and must be cheap.
pub trait FrameListener: Send + Sync + 'static {
    /// A frame was received.
    fn on_frame_input(&self, session: SessionId, frame: &Frame) {
        let _ = (session, frame);
    }

    /// A frame is about to be written.
    fn on_frame_output(&self, session: SessionId, frame: &Frame) {
        let _ = (session, frame);
    }

    /// A receive window changed. `stream` is zero for the connection window.
    fn on_input_flow_control(&self, session: SessionId, stream: StreamId, delta: i64, window: i64) {
        let _ = (session, stream, delta, window);
    }

    /// A send window changed. `stream` is zero for the connection window.
    fn on_output_flow_control(&self, session: SessionId, stream: StreamId, delta: i64, window: i64) {
        let _ = (session, stream, delta, window);
    }
}

/// Logs frames and window changes at `TRACE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl FrameListener for TracingListener {
    fn on_frame_input(&self, session: SessionId, frame: &Frame) {
        tracing::trace!(%session, stream = %frame.stream_id(), "<< {}", frame.kind());
    }

    fn on_frame_output(&self, session: SessionId, frame: &Frame) {
        tracing::trace!(%session, stream = %frame.stream_id(), ">> {}", frame.kind());
    }

    fn on_input_flow_control(&self, session: SessionId, stream: StreamId, delta: i64, window: i64) {
        tracing::trace!(%session, %stream, delta, window, "input window");
    }

    fn on_output_flow_control(&self, session: SessionId, stream: StreamId, delta: i64, window: i64) {
        tracing::trace!(%session, %stream, delta, window, "output window");
    }
}
