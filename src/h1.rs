//! HTTP/1.1 sessions.
//!
//! HTTP/1.1 is spoken by [`hyper`]'s client connection. An [`Http1Session`]
//! owns the hyper [`SendRequest`] handle in a driver task which executes
//! queued exchanges one at a time: the request body is pulled from the
//! handler and buffered, then the response is streamed back into it frame by
//! frame.

use std::fmt;
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, HOST};
use http::uri::PathAndQuery;
use http::{Method, Uri, Version};
use http_body::Body as _;
use http_body_util::{BodyExt as _, Full};
use hyper::client::conn::http1::{Builder, SendRequest};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, Instrument};

use crate::bridge::HyperIo;
use crate::cancel::Cancellable;
use crate::conn::Stream;
use crate::exchange::{CapacityChannel, DataChannel, ExchangeHandler, HttpContext, StreamHandle};
use crate::h2::StreamId;
use crate::info::{ConnectionInfo, HasConnectionInfo, HasTlsConnectionInfo, TlsConnectionInfo};
use crate::session::{
    enqueue_or_fail, CloseMode, CloseOnDrop, Command, CommandQueue, ExecutableCommand, Priority,
    Session, SessionId,
};
use crate::version::HttpProtocol;
use crate::Error;

/// Largest chunk of request body pulled from a handler in one round.
const CHUNK_SIZE: usize = 64 * 1024;

struct Shared {
    id: SessionId,
    queue: Arc<CommandQueue>,
    open: AtomicBool,
    info: ConnectionInfo,
    tls: Option<TlsConnectionInfo>,
}

impl Shared {
    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // Wake the driver so it notices.
            let _ = self
                .queue
                .push(Command::Shutdown(CloseMode::Immediate), Priority::Immediate);
        }
    }
}

/// A handle to an HTTP/1.1 connection.
///
/// HTTP/1.1 connections carry one exchange at a time; the pool leases them
/// exclusively. The connection is closed once the last handle is dropped.
#[derive(Clone)]
pub struct Http1Session {
    shared: Arc<Shared>,
    _close: Arc<CloseOnDrop>,
}

impl fmt::Debug for Http1Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Session")
            .field("id", &self.shared.id)
            .field("open", &self.is_open())
            .field("remote", &self.shared.info.remote_addr())
            .finish()
    }
}

impl Http1Session {
    /// Perform the HTTP/1.1 handshake over `stream` and spawn the
    /// connection and driver tasks.
    pub async fn handshake(builder: &Builder, stream: Stream) -> Result<Self, Error> {
        let info = stream.info();
        let tls = stream.tls_info().cloned();

        let (sender, conn) = builder
            .handshake::<_, Full<Bytes>>(HyperIo::new(stream))
            .await
            .map_err(Error::connect)?;

        let id = SessionId::next();
        let queue = Arc::new(CommandQueue::new());
        let shared = Arc::new(Shared {
            id,
            queue: queue.clone(),
            open: AtomicBool::new(true),
            info,
            tls,
        });

        let span = tracing::trace_span!("h1", session = %id);
        let watcher = shared.clone();
        tokio::spawn(
            async move {
                if let Err(error) = conn.await {
                    debug!(%error, "http/1.1 connection error");
                }
                trace!("http/1.1 connection finished");
                watcher.mark_closed();
            }
            .instrument(span.clone()),
        );
        tokio::spawn(drive(sender, shared.clone()).instrument(span));

        debug!(session = %id, "h1 session started");
        Ok(Self {
            shared,
            _close: Arc::new(CloseOnDrop::new(queue)),
        })
    }
}

impl Session for Http1Session {
    fn id(&self) -> SessionId {
        self.shared.id
    }

    fn protocol(&self) -> HttpProtocol {
        HttpProtocol::Http1
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

async fn drive(mut sender: SendRequest<Full<Bytes>>, shared: Arc<Shared>) {
    while let Some(command) = poll_fn(|cx| shared.queue.poll_pop(cx)).await {
        match command {
            Command::Execute(command) => {
                if !shared.open.load(Ordering::Acquire) {
                    command.fail(Error::ConnectionClosed);
                    continue;
                }
                execute(&mut sender, &shared, *command).await;
            }
            Command::Shutdown(mode) => {
                trace!(?mode, "shutting down");
                break;
            }
            other => trace!(command = ?other, "command not applicable to http/1.1"),
        }
    }

    shared.open.store(false, Ordering::Release);
    for command in shared.queue.close() {
        command.fail(Error::ConnectionClosed);
    }
    debug!(session = %shared.id, "h1 session closed");
}

/// Cancels the exchange running on the driver.
struct CancelExchange(Mutex<Option<oneshot::Sender<()>>>);

impl Cancellable for CancelExchange {
    fn cancel(&self) -> bool {
        self.0
            .lock()
            .take()
            .is_some_and(|tx| tx.send(()).is_ok())
    }
}

/// Run one exchange to completion.
///
/// An exchange which did not finish leaves the connection mid-message, so the
/// session is closed before the handler releases its lease.
async fn execute(
    sender: &mut SendRequest<Full<Bytes>>,
    shared: &Shared,
    command: ExecutableCommand,
) {
    let ExecutableCommand {
        mut handler,
        cancellable,
        mut context,
        ..
    } = command;

    if cancellable.is_cancelled() {
        handler.cancel();
        handler.release_resources();
        return;
    }

    let (tx, mut cancelled) = oneshot::channel();
    cancellable.set_dependency(Box::new(CancelExchange(Mutex::new(Some(tx)))));

    let outcome = tokio::select! {
        biased;
        Ok(()) = &mut cancelled => None,
        result = exchange(sender, handler.as_mut(), &mut context) => Some(result),
    };

    match outcome {
        Some(Ok(())) => {}
        Some(Err(Error::Cancelled)) | None => {
            trace!("exchange cancelled");
            shared.mark_closed();
            handler.cancel();
        }
        Some(Err(error)) => {
            trace!(%error, "exchange failed");
            shared.mark_closed();
            handler.failed(error);
        }
    }
    handler.release_resources();
}

async fn exchange(
    sender: &mut SendRequest<Full<Bytes>>,
    handler: &mut dyn ExchangeHandler,
    context: &mut HttpContext,
) -> Result<(), Error> {
    let head = handler.produce_request(context)?;
    let mut parts = head.parts;
    origin_form(&mut parts);

    let body = if head.has_body {
        collect_body(handler).await?
    } else {
        Bytes::new()
    };

    sender.ready().await.map_err(Error::transport)?;
    let response = sender
        .send_request(http::Request::from_parts(parts, Full::new(body)))
        .await
        .map_err(Error::transport)?;

    let (parts, mut body) = response.into_parts();
    let end_stream = body.is_end_stream();
    handler.consume_response(parts, end_stream)?;
    if end_stream {
        return Ok(());
    }

    let mut trailers = None;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(Error::transport)?;
        match frame.into_data() {
            Ok(data) => {
                if data.is_empty() {
                    continue;
                }
                let consumed = u32::try_from(data.len()).unwrap_or(u32::MAX);
                handler.consume(data)?;
                // No receive window to replenish; the grant is only reported.
                let mut channel = CapacityChannel::new(consumed, None);
                handler.update_capacity(&mut channel);
            }
            Err(frame) => {
                if let Ok(map) = frame.into_trailers() {
                    trailers = Some(map);
                }
            }
        }
    }

    handler.stream_end(trailers)
}

/// Pull the whole request body from the handler.
///
/// A handler with nothing to write parks until it calls
/// [`StreamHandle::request_output`](crate::exchange::StreamHandle::request_output).
async fn collect_body(handler: &mut dyn ExchangeHandler) -> Result<Bytes, Error> {
    // HTTP/1.1 has no streams; the handle only routes resumption back here.
    let resume = Arc::new(CommandQueue::new());
    let stream = StreamHandle::new(StreamId::FIRST_CLIENT, &resume);

    let mut body = BytesMut::new();
    loop {
        let mut channel = DataChannel::new(CHUNK_SIZE, Some(stream.clone()));
        handler.produce(&mut channel)?;
        let written = channel.written();
        let (chunks, end) = channel.into_parts();
        for chunk in chunks {
            body.extend_from_slice(&chunk);
        }

        match end {
            Some(trailers) => {
                if trailers.is_some() {
                    debug!("request trailers are not sent over http/1.1");
                }
                return Ok(body.freeze());
            }
            None if written == 0 => wait_for_output(&resume).await?,
            None => {}
        }
    }
}

async fn wait_for_output(resume: &CommandQueue) -> Result<(), Error> {
    loop {
        match poll_fn(|cx| resume.poll_pop(cx)).await {
            Some(Command::RequestOutput(_)) => return Ok(()),
            Some(Command::CancelStream(_)) => return Err(Error::Cancelled),
            Some(_) => continue,
            None => return Err(Error::ConnectionClosed),
        }
    }
}

/// Rewrite an absolute request URI into origin form, moving the authority
/// into the `Host` header.
fn origin_form(parts: &mut http::request::Parts) {
    parts.version = Version::HTTP_11;

    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(HOST, value);
            }
        }
    }

    if parts.method != Method::CONNECT {
        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path);
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http::StatusCode;
    use hyper::body::Incoming;
    use hyper::service::service_fn;

    use super::*;
    use crate::exchange::{BasicExchange, BytesRequest, BytesResponse, RequestHead, ResponseFuture};
    use crate::CancellableHandle;

    static_assertions::assert_impl_all!(Http1Session: Session, Clone, Send, Sync);

    async fn echo(request: http::Request<Incoming>) -> Result<http::Response<Full<Bytes>>, Infallible> {
        let host = request
            .headers()
            .get(HOST)
            .map(|host| host.to_str().unwrap().to_owned())
            .unwrap_or_default();
        let path = request.uri().to_string();
        let body = request.into_body().collect().await.unwrap().to_bytes();
        Ok(http::Response::builder()
            .header("x-host", host)
            .header("x-path", path)
            .body(Full::new(body))
            .unwrap())
    }

    async fn session() -> Http1Session {
        let (client, server) = tokio::io::duplex(1024 * 64);
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(HyperIo::new(server), service_fn(echo))
                .await;
        });
        Http1Session::handshake(&Builder::new(), Stream::new(client))
            .await
            .unwrap()
    }

    fn submit(
        session: &Http1Session,
        request: http::Request<Bytes>,
    ) -> ResponseFuture<http::Response<Bytes>> {
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

    #[test]
    fn origin_form_moves_authority() {
        let (mut parts, _) = http::Request::get("http://example.com:8080/a?b=c")
            .body(())
            .unwrap()
            .into_parts();
        origin_form(&mut parts);
        assert_eq!(parts.uri, "/a?b=c");
        assert_eq!(parts.headers[HOST], "example.com:8080");
    }

    #[tokio::test]
    async fn sequential_exchanges() {
        let _ = tracing_subscriber::fmt::try_init();
        let session = session().await;
        assert_eq!(session.protocol(), HttpProtocol::Http1);

        let request = http::Request::post("http://example.com/echo")
            .body(Bytes::from_static(b"hello"))
            .unwrap();
        let first = submit(&session, request);
        let second = submit(
            &session,
            http::Request::get("http://example.com/empty")
                .body(Bytes::new())
                .unwrap(),
        );

        let first = first.await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-host"], "example.com");
        assert_eq!(first.headers()["x-path"], "/echo");
        assert_eq!(first.body(), &Bytes::from_static(b"hello"));

        let second = second.await.unwrap();
        assert_eq!(second.headers()["x-path"], "/empty");
        assert!(second.body().is_empty());
        assert!(session.is_open());
    }

    #[derive(Default)]
    struct Deferred {
        produces: std::sync::atomic::AtomicUsize,
        ready: AtomicBool,
        stream: Mutex<Option<StreamHandle>>,
    }

    /// Sends its body only once told it is ready.
    struct DeferredBody {
        state: Arc<Deferred>,
        body: BytesMut,
        done: Option<oneshot::Sender<Result<Bytes, Error>>>,
    }

    impl ExchangeHandler for DeferredBody {
        fn produce_request(&mut self, _context: &mut HttpContext) -> Result<RequestHead, Error> {
            let (parts, _) = http::Request::post("http://example.com/deferred")
                .body(())
                .unwrap()
                .into_parts();
            Ok(RequestHead::new(parts, true))
        }

        fn produce(&mut self, channel: &mut DataChannel) -> Result<(), Error> {
            self.state.produces.fetch_add(1, Ordering::SeqCst);
            if self.state.ready.load(Ordering::SeqCst) {
                channel.write(&mut Bytes::from_static(b"late"));
                channel.end_stream(None);
            } else {
                *self.state.stream.lock() = channel.stream().cloned();
            }
            Ok(())
        }

        fn consume_response(&mut self, _: http::response::Parts, _: bool) -> Result<(), Error> {
            Ok(())
        }

        fn consume(&mut self, data: Bytes) -> Result<(), Error> {
            self.body.extend_from_slice(&data);
            Ok(())
        }

        fn stream_end(&mut self, _trailers: Option<http::HeaderMap>) -> Result<(), Error> {
            if let Some(done) = self.done.take() {
                let _ = done.send(Ok(self.body.split().freeze()));
            }
            Ok(())
        }

        fn cancel(&mut self) {}

        fn failed(&mut self, error: Error) {
            if let Some(done) = self.done.take() {
                let _ = done.send(Err(error));
            }
        }

        fn release_resources(&mut self) {}
    }

    #[tokio::test]
    async fn idle_body_producer_waits_for_request_output() {
        let session = session().await;
        let state = Arc::new(Deferred::default());
        let (tx, rx) = oneshot::channel();
        let handler = DeferredBody {
            state: state.clone(),
            body: BytesMut::new(),
            done: Some(tx),
        };
        session.enqueue(
            Command::Execute(Box::new(ExecutableCommand::new(
                Box::new(handler),
                None,
                CancellableHandle::new(),
                HttpContext::new(),
            ))),
            Priority::Normal,
        );

        let stream = loop {
            if let Some(stream) = state.stream.lock().clone() {
                break stream;
            }
            tokio::task::yield_now().await;
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(state.produces.load(Ordering::SeqCst), 1);

        state.ready.store(true, Ordering::SeqCst);
        assert!(stream.request_output());

        let body = rx.await.unwrap().unwrap();
        assert_eq!(body, Bytes::from_static(b"late"));
        assert_eq!(state.produces.load(Ordering::SeqCst), 2);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn failed_exchange_closes_session_before_release() {
        let session = session().await;
        let observed = Arc::new(Mutex::new(None));

        struct FailOnResponse {
            session: Http1Session,
            open_at_release: Arc<Mutex<Option<bool>>>,
        }

        impl ExchangeHandler for FailOnResponse {
            fn produce_request(&mut self, _context: &mut HttpContext) -> Result<RequestHead, Error> {
                let (parts, _) = http::Request::get("http://example.com/")
                    .body(())
                    .unwrap()
                    .into_parts();
                Ok(RequestHead::new(parts, false))
            }

            fn consume_response(&mut self, _: http::response::Parts, _: bool) -> Result<(), Error> {
                Err(Error::protocol("unwanted response"))
            }

            fn consume(&mut self, _data: Bytes) -> Result<(), Error> {
                Ok(())
            }

            fn stream_end(&mut self, _trailers: Option<http::HeaderMap>) -> Result<(), Error> {
                Ok(())
            }

            fn cancel(&mut self) {}

            fn failed(&mut self, _error: Error) {}

            fn release_resources(&mut self) {
                *self.open_at_release.lock() = Some(self.session.is_open());
            }
        }

        session.enqueue(
            Command::Execute(Box::new(ExecutableCommand::new(
                Box::new(FailOnResponse {
                    session: session.clone(),
                    open_at_release: observed.clone(),
                }),
                None,
                CancellableHandle::new(),
                HttpContext::new(),
            ))),
            Priority::Normal,
        );

        let open = loop {
            if let Some(open) = *observed.lock() {
                break open;
            }
            tokio::task::yield_now().await;
        };
        assert!(!open);
    }

    #[tokio::test]
    async fn cancelled_before_execution() {
        let session = session().await;
        let request = http::Request::get("http://example.com/")
            .body(Bytes::new())
            .unwrap();
        let response = submit(&session, request);
        response.cancel();
        assert!(matches!(response.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn closed_session_fails_commands() {
        let session = session().await;
        session.close(CloseMode::Immediate);
        assert!(!session.is_open());

        let request = http::Request::get("http://example.com/")
            .body(Bytes::new())
            .unwrap();
        let error = submit(&session, request).await.unwrap_err();
        assert!(matches!(error, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn server_hangup_closes_session() {
        let (client, server) = tokio::io::duplex(1024);
        let session = Http1Session::handshake(&Builder::new(), Stream::new(client))
            .await
            .unwrap();
        drop(server);

        let request = http::Request::get("http://example.com/")
            .body(Bytes::new())
            .unwrap();
        let error = submit(&session, request).await.unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Connection);
        assert!(!session.is_open());
    }
}
