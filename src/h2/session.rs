//! The HTTP/2 session handle and its driver task.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures_util::{Sink, Stream};
use tracing::Instrument;

use super::listener::FrameListener;
use super::mux::Multiplexer;
use super::{Config, FrameCodec};
use crate::info::{ConnectionInfo, TlsConnectionInfo};
use crate::session::{
    enqueue_or_fail, CloseMode, CloseOnDrop, Command, CommandQueue, Priority, Session, SessionId,
};
use crate::version::HttpProtocol;
use crate::Error;

/// Work items handled per poll before the driver yields to the runtime.
const BUDGET: usize = 32;

struct Shared {
    id: SessionId,
    queue: Arc<CommandQueue>,
    open: AtomicBool,
    info: ConnectionInfo,
    tls: Option<TlsConnectionInfo>,
}

/// A handle to an HTTP/2 connection.
///
/// Handles are cheap to clone and may be shared by any number of borrowers;
/// exchanges enqueued through any of them are multiplexed onto the same
/// connection. The connection is shut down gracefully once the last handle
/// is dropped.
#[derive(Clone)]
pub struct Http2Session {
    shared: Arc<Shared>,
    _close: Arc<CloseOnDrop>,
}

impl fmt::Debug for Http2Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Session")
            .field("id", &self.shared.id)
            .field("open", &self.is_open())
            .field("remote", &self.shared.info.remote_addr())
            .finish()
    }
}

impl Http2Session {
    /// Start a session over `codec`, spawning its driver on the current
    /// tokio runtime.
    pub fn start<C: FrameCodec>(
        codec: C,
        config: Config,
        info: ConnectionInfo,
        tls: Option<TlsConnectionInfo>,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> Self {
        let (session, driver) = Self::new(codec, config, info, tls, listener);
        let span = tracing::trace_span!("h2", session = %session.id());
        tokio::spawn(driver.instrument(span));
        session
    }

    /// Create a session and the driver future which must be polled for it to
    /// make progress.
    pub fn new<C: FrameCodec>(
        codec: C,
        config: Config,
        info: ConnectionInfo,
        tls: Option<TlsConnectionInfo>,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> (Self, SessionDriver<C>) {
        let id = SessionId::next();
        let queue = Arc::new(CommandQueue::new());
        let shared = Arc::new(Shared {
            id,
            queue: queue.clone(),
            open: AtomicBool::new(true),
            info,
            tls,
        });

        let driver = SessionDriver {
            codec,
            mux: Multiplexer::new(id, config, queue.clone(), listener),
            shared: shared.clone(),
            closing: false,
        };

        tracing::debug!(session = %id, "h2 session started");
        (
            Self {
                shared,
                _close: Arc::new(CloseOnDrop::new(queue)),
            },
            driver,
        )
    }
}

impl Session for Http2Session {
    fn id(&self) -> SessionId {
        self.shared.id
    }

    fn protocol(&self) -> HttpProtocol {
        HttpProtocol::Http2
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire) && !self.shared.queue.is_closed()
    }

    fn enqueue(&self, command: Command, priority: Priority) {
        enqueue_or_fail(&self.shared.queue, command, priority);
    }

    fn close(&self, mode: CloseMode) {
        if self
            .shared
            .queue
            .push(Command::Shutdown(mode), Priority::Immediate)
            .is_ok()
        {
            self.shared.open.store(false, Ordering::Release);
        }
    }

    fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    fn tls_info(&self) -> Option<&TlsConnectionInfo> {
        self.shared.tls.as_ref()
    }
}

/// Drives one HTTP/2 connection: executes queued commands, reads frames from
/// the codec into the multiplexer, and writes its output.
///
/// Resolves once the connection has closed.
#[must_use = "futures do nothing unless polled"]
pub struct SessionDriver<C> {
    codec: C,
    mux: Multiplexer,
    shared: Arc<Shared>,
    closing: bool,
}

impl<C> fmt::Debug for SessionDriver<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDriver")
            .field("mux", &self.mux)
            .field("closing", &self.closing)
            .finish()
    }
}

impl<C: FrameCodec> SessionDriver<C> {
    fn poll_commands(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        for _ in 0..BUDGET {
            match self.shared.queue.poll_pop(cx) {
                Poll::Ready(Some(command)) => {
                    self.mux.handle_command(command);
                    progress = true;
                }
                Poll::Ready(None) | Poll::Pending => break,
            }
        }
        progress
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        for _ in 0..BUDGET {
            match Pin::new(&mut self.codec).poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    progress = true;
                    if let Err(error) = self.mux.recv_frame(frame) {
                        self.mux.connection_error(error);
                        break;
                    }
                }
                Poll::Ready(Some(Err(error))) => {
                    self.mux.disconnected(Some(error));
                    return true;
                }
                Poll::Ready(None) => {
                    self.mux.disconnected(None);
                    return true;
                }
                Poll::Pending => break,
            }
        }
        progress
    }

    fn poll_write(&mut self, cx: &mut Context<'_>) -> bool {
        let mut written = 0;
        while written < BUDGET {
            match Pin::new(&mut self.codec).poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(error)) => {
                    self.mux.disconnected(Some(error));
                    return true;
                }
                Poll::Pending => break,
            }

            let Some(frame) = self.mux.poll_output() else {
                break;
            };
            if let Err(error) = Pin::new(&mut self.codec).start_send(frame) {
                self.mux.disconnected(Some(error));
                return true;
            }
            written += 1;
        }

        if let Poll::Ready(Err(error)) = Pin::new(&mut self.codec).poll_flush(cx) {
            self.mux.disconnected(Some(error));
            return true;
        }
        written > 0
    }

    fn begin_close(&mut self) {
        self.closing = true;
        self.shared.open.store(false, Ordering::Release);
        let leftover = self.shared.queue.close();
        if !leftover.is_empty() {
            tracing::trace!(commands = leftover.len(), "failing commands queued on closed session");
        }
        for command in leftover {
            command.fail(Error::ConnectionClosed);
        }
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            match Pin::new(&mut self.codec).poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => break,
                Poll::Pending => return Poll::Pending,
            }
            let Some(frame) = self.mux.poll_output() else {
                break;
            };
            if Pin::new(&mut self.codec).start_send(frame).is_err() {
                break;
            }
        }

        if let Err(error) = ready!(Pin::new(&mut self.codec).poll_close(cx)) {
            tracing::trace!(%error, "error closing frame codec");
        }
        tracing::debug!(session = %self.shared.id, "h2 session closed");
        Poll::Ready(())
    }
}

impl<C: FrameCodec> Future for SessionDriver<C> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.closing {
            return this.poll_shutdown(cx);
        }

        for _ in 0..BUDGET {
            let commands = this.poll_commands(cx);
            let read = this.poll_read(cx);
            let written = this.poll_write(cx);

            if this.mux.is_closed() {
                this.begin_close();
                return this.poll_shutdown(cx);
            }
            this.shared.open.store(this.mux.is_open(), Ordering::Release);

            if !(commands || read || written) {
                return Poll::Pending;
            }
        }

        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::*;
    use crate::exchange::{BasicExchange, BytesRequest, BytesResponse, HttpContext, ResponseFuture};
    use crate::h2::{pipe, Frame, HeaderBlock, PipePeer, Settings, StreamId};
    use crate::session::ExecutableCommand;
    use crate::CancellableHandle;

    static_assertions::assert_impl_all!(Http2Session: Session, Clone, Send, Sync);

    fn submit(session: &Http2Session, uri: &str) -> ResponseFuture<http::Response<Bytes>> {
        let request = http::Request::get(uri).body(Bytes::new()).unwrap();
        let (exchange, rx) = BasicExchange::new(BytesRequest::new(request), BytesResponse::new());
        let handle = CancellableHandle::new();
        session.enqueue(
            Command::Execute(Box::new(ExecutableCommand::new(
                Box::new(exchange),
                None,
                handle.clone(),
                HttpContext::new(),
            ))),
            Priority::Normal,
        );
        ResponseFuture::new(rx, handle)
    }

    async fn expect_headers(peer: &mut PipePeer) -> StreamId {
        loop {
            match peer.recv().await {
                Some(Frame::Headers { stream_id, .. }) => return stream_id,
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
    }

    #[tokio::test]
    async fn exchange_over_pipe() {
        let _ = tracing_subscriber::fmt::try_init();
        let (codec, mut peer) = pipe();
        let session = Http2Session::start(codec, Config::default(), ConnectionInfo::default(), None, None);
        assert!(session.is_open());

        let response = submit(&session, "http://example.com/");
        let stream_id = expect_headers(&mut peer).await;
        assert_eq!(stream_id, StreamId::new(1));

        peer.send(Frame::Headers {
            stream_id,
            block: HeaderBlock::response(StatusCode::OK, HeaderMap::new()),
            end_stream: false,
        })
        .unwrap();
        peer.send(Frame::Data {
            stream_id,
            payload: Bytes::from_static(b"hello"),
            end_stream: true,
        })
        .unwrap();

        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn peer_disconnect_closes_session() {
        let (codec, mut peer) = pipe();
        let session = Http2Session::start(codec, Config::default(), ConnectionInfo::default(), None, None);

        let response = submit(&session, "http://example.com/");
        expect_headers(&mut peer).await;
        peer.close();

        let error = response.await.unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Connection);

        while peer.recv().await.is_some() {}
        assert!(!session.is_open());

        let late = submit(&session, "http://example.com/");
        assert!(matches!(late.await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn dropping_handles_shuts_down() {
        let (codec, mut peer) = pipe();
        let session = Http2Session::start(codec, Config::default(), ConnectionInfo::default(), None, None);
        peer.send(Frame::Settings {
            ack: false,
            settings: Settings::default(),
        })
        .unwrap();
        drop(session);

        let mut saw_goaway = false;
        while let Some(frame) = peer.recv().await {
            saw_goaway |= matches!(frame, Frame::GoAway { .. });
        }
        assert!(saw_goaway);
    }
}
