//! Establishing sessions.
//!
//! Connecting happens in three steps: a [`Transport`] opens a byte stream to
//! the [`Target`], a [`TlsStrategy`] upgrades it when the target is secure,
//! and the [`ProtocolNegotiator`] picks HTTP/1.1 or HTTP/2 for the resulting
//! stream. [`HttpConnector`] runs the steps and produces an [`HttpSession`];
//! the pool drives any [`Connect`] implementation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tower::util::Oneshot;
use tower::ServiceExt as _;
use tracing::{debug, Instrument};

use crate::h1::Http1Session;
use crate::h2::{self, CodecFactory, FrameListener, Http2Session};
use crate::info::{ConnectionInfo, HasConnectionInfo, HasTlsConnectionInfo, TlsConnectionInfo};
use crate::pool::PoolableSession;
use crate::session::{CloseMode, Command, Priority, Session, SessionId};
use crate::version::{HttpProtocol, ProtocolNegotiator};
use crate::{BoxError, BoxFuture, Error, Target, VersionPolicy};

mod stream;
pub mod tcp;
mod tls;

pub use self::stream::{Io, Stream};
pub use self::tcp::{TcpTransport, TcpTransportConfig};
#[cfg(feature = "tls")]
pub use self::tls::RustlsStrategy;
pub use self::tls::TlsStrategy;

/// Opens byte streams to targets.
///
/// Any clonable [`tower::Service`] from [`Target`] to a connected stream is a
/// transport.
pub trait Transport: Clone + Send + Sync + 'static {
    /// The connected stream.
    type IO: AsyncRead + AsyncWrite + HasConnectionInfo + Send + Unpin + 'static;

    /// Error raised when the connection cannot be made.
    type Error: Into<BoxError>;

    /// Future returned by [`Transport::connect`].
    type Future: Future<Output = Result<Self::IO, Self::Error>> + Send + 'static;

    /// Connect to `target`.
    fn connect(&mut self, target: Target) -> Self::Future;

    /// Is the transport ready to connect?
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
}

impl<T, IO> Transport for T
where
    T: tower::Service<Target, Response = IO> + Clone + Send + Sync + 'static,
    T::Error: Into<BoxError>,
    T::Future: Send + 'static,
    IO: AsyncRead + AsyncWrite + HasConnectionInfo + Send + Unpin + 'static,
{
    type IO = IO;
    type Error = T::Error;
    type Future = T::Future;

    fn connect(&mut self, target: Target) -> Self::Future {
        self.call(target)
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        tower::Service::poll_ready(self, cx)
    }
}

/// What the pool asks a connector for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Where to connect.
    pub target: Target,

    /// Which HTTP versions the new session may speak.
    pub policy: VersionPolicy,
}

impl ConnectRequest {
    /// Create a connect request.
    pub fn new(target: Target, policy: VersionPolicy) -> Self {
        Self { target, policy }
    }
}

/// Establishes sessions for the pool.
///
/// Any clonable [`tower::Service`] from [`ConnectRequest`] to a
/// [`PoolableSession`] is a connector.
pub trait Connect: Clone + Send + Sync + 'static {
    /// The sessions produced.
    type Session: PoolableSession;

    /// Future returned by [`Connect::connect`].
    type Future: Future<Output = Result<Self::Session, Error>> + Send + 'static;

    /// Establish a session.
    fn connect(&self, request: ConnectRequest) -> Self::Future;
}

impl<S> Connect for S
where
    S: tower::Service<ConnectRequest, Error = Error> + Clone + Send + Sync + 'static,
    S::Response: PoolableSession,
    S::Future: Send + 'static,
{
    type Session = S::Response;
    type Future = Oneshot<S, ConnectRequest>;

    fn connect(&self, request: ConnectRequest) -> Self::Future {
        self.clone().oneshot(request)
    }
}

/// Connects over a transport, upgrades to TLS when needed, and starts an
/// HTTP/1.1 or HTTP/2 session as negotiated.
///
/// HTTP/2 sessions need a [`CodecFactory`] to frame the connected stream.
/// Without one, connections which negotiate HTTP/2 fail.
#[derive(Clone)]
pub struct HttpConnector<T = TcpTransport> {
    transport: T,
    tls: Option<Arc<dyn TlsStrategy>>,
    negotiator: ProtocolNegotiator,
    http1: hyper::client::conn::http1::Builder,
    http2: h2::Config,
    codec: Option<Arc<dyn CodecFactory>>,
    listener: Option<Arc<dyn FrameListener>>,
}

impl<T: fmt::Debug> fmt::Debug for HttpConnector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("transport", &self.transport)
            .field("tls", &self.tls.is_some())
            .field("negotiator", &self.negotiator)
            .field("http2", &self.http2)
            .field("codec", &self.codec.is_some())
            .finish()
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(TcpTransport::default())
    }
}

impl<T> HttpConnector<T> {
    /// Create a connector over `transport`, without TLS or HTTP/2 framing.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            tls: None,
            negotiator: ProtocolNegotiator::default(),
            http1: hyper::client::conn::http1::Builder::new(),
            http2: h2::Config::default(),
            codec: None,
            listener: None,
        }
    }

    /// Connect over a different transport, keeping everything else.
    pub fn with_transport<T2>(self, transport: T2) -> HttpConnector<T2> {
        HttpConnector {
            transport,
            tls: self.tls,
            negotiator: self.negotiator,
            http1: self.http1,
            http2: self.http2,
            codec: self.codec,
            listener: self.listener,
        }
    }

    /// Upgrade secure targets with `tls`.
    pub fn with_tls<S: TlsStrategy>(mut self, tls: S) -> Self {
        self.tls = Some(Arc::new(tls));
        self
    }

    /// Decide protocols with `negotiator`.
    pub fn with_negotiator(mut self, negotiator: ProtocolNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    /// Configure the hyper HTTP/1.1 handshake.
    pub fn with_http1(mut self, builder: hyper::client::conn::http1::Builder) -> Self {
        self.http1 = builder;
        self
    }

    /// Configure HTTP/2 sessions.
    pub fn with_http2(mut self, config: h2::Config) -> Self {
        self.http2 = config;
        self
    }

    /// Frame HTTP/2 connections with `codec`.
    pub fn with_codec<F: CodecFactory>(mut self, codec: F) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Observe HTTP/2 frames with `listener`.
    pub fn with_listener<L: FrameListener>(mut self, listener: L) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// The HTTP/2 configuration.
    pub fn http2(&self) -> &h2::Config {
        &self.http2
    }
}

impl<T> tower::Service<ConnectRequest> for HttpConnector<T>
where
    T: Transport,
{
    type Response = HttpSession;
    type Error = Error;
    type Future = BoxFuture<'static, Result<HttpSession, Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.transport.poll_ready(cx).map_err(Error::connect)
    }

    fn call(&mut self, request: ConnectRequest) -> Self::Future {
        let mut connector = std::mem::replace(self, self.clone());
        let span = tracing::debug_span!("connect", target = %request.target, policy = %request.policy);

        Box::pin(
            async move {
                let ConnectRequest { target, policy } = request;
                let io = connector
                    .transport
                    .connect(target.clone())
                    .await
                    .map_err(Error::connect)?;
                let mut stream = Stream::new(io);

                if target.is_secure() {
                    let tls = connector.tls.as_ref().ok_or(Error::NoTlsStrategy)?;
                    stream = tls
                        .upgrade(stream, &target, policy)
                        .await
                        .map_err(Error::connect)?;
                }

                let protocol = connector.negotiator.negotiate(policy, stream.tls_info());
                let session = match protocol {
                    HttpProtocol::Http1 => {
                        HttpSession::Http1(Http1Session::handshake(&connector.http1, stream).await?)
                    }
                    HttpProtocol::Http2 => {
                        let codec = connector.codec.as_ref().ok_or_else(|| {
                            Error::connect("HTTP/2 selected but no frame codec is configured")
                        })?;
                        let info = stream.info();
                        let tls = stream.tls_info().cloned();
                        HttpSession::Http2(Http2Session::start(
                            codec.codec(stream),
                            connector.http2.clone(),
                            info,
                            tls,
                            connector.listener.clone(),
                        ))
                    }
                };

                debug!(session = %session.id(), %protocol, "connected");
                Ok(session)
            }
            .instrument(span),
        )
    }
}

/// A session established by [`HttpConnector`].
#[derive(Debug, Clone)]
pub enum HttpSession {
    /// An HTTP/1.1 connection.
    Http1(Http1Session),

    /// An HTTP/2 connection.
    Http2(Http2Session),
}

impl HttpSession {
    fn inner(&self) -> &dyn Session {
        match self {
            HttpSession::Http1(session) => session,
            HttpSession::Http2(session) => session,
        }
    }
}

impl Session for HttpSession {
    fn id(&self) -> SessionId {
        self.inner().id()
    }

    fn protocol(&self) -> HttpProtocol {
        self.inner().protocol()
    }

    fn is_open(&self) -> bool {
        self.inner().is_open()
    }

    fn enqueue(&self, command: Command, priority: Priority) {
        self.inner().enqueue(command, priority)
    }

    fn close(&self, mode: CloseMode) {
        self.inner().close(mode)
    }

    fn info(&self) -> &ConnectionInfo {
        self.inner().info()
    }

    fn tls_info(&self) -> Option<&TlsConnectionInfo> {
        self.inner().tls_info()
    }
}

impl PoolableSession for HttpSession {}
