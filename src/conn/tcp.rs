//! TCP transport for client connections.
//!
//! [`TcpTransport`] is a [`tower::Service`] which resolves a [`Target`] and
//! connects to the first address which accepts the connection. It is the
//! default transport used by the [`Requester`](crate::Requester).

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument};

use crate::{BoxFuture, Target};

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// The timeout for connecting to a single remote address.
    pub connect_timeout: Option<Duration>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<u32>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<u32>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            local_address_ipv4: None,
            local_address_ipv6: None,
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// A TCP connector for client connections.
///
/// Host names are resolved with the system resolver; each resolved address
/// is tried in turn until one connects.
///
/// # Example
/// ```no_run
/// # use switchyard::conn::TcpTransport;
/// # use tower::ServiceExt as _;
/// # async fn run() {
/// let transport = TcpTransport::default();
/// let target = "http://example.com".parse().unwrap();
/// let stream = transport.oneshot(target).await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
}

impl TcpTransport {
    /// Create a TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    async fn connect(&self, host: String, port: u16) -> Result<TcpStream, TcpConnectionError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(TcpConnectionError::msg("dns resolution"))?
            .collect();
        trace!(addresses = addrs.len(), "resolved host");

        let mut last_error = None;
        for address in addrs {
            let span = tracing::trace_span!("connect", %address);
            match connect(address, &self.config).instrument(span).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    trace!(%address, %error, "connection attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TcpConnectionError::new("exhausted connection candidates")))
    }
}

impl tower::Service<Target> for TcpTransport {
    type Response = TcpStream;
    type Error = TcpConnectionError;
    type Future = BoxFuture<'static, Result<TcpStream, TcpConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let transport = std::mem::replace(self, self.clone());
        let (host, port) = target.address();
        let host = host.to_owned();
        let span = tracing::trace_span!("tcp", %host, %port);

        Box::pin(
            async move {
                let stream = transport.connect(host, port).await?;

                if let Ok(peer_addr) = stream.peer_addr() {
                    trace!(peer.addr = %peer_addr, "tcp connected");
                } else {
                    trace!("tcp connected");
                }

                Ok(stream)
            }
            .instrument(span),
        )
    }
}

/// Error type for TCP connections.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<io::Error>,
}

impl TcpConnectionError {
    fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    fn msg<S: Into<String>>(message: S) -> impl FnOnce(io::Error) -> Self {
        move |error| Self {
            message: message.into(),
            source: Some(error),
        }
    }

    /// Did the attempt fail because the connect timeout elapsed?
    pub fn is_timeout(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|error| error.kind() == io::ErrorKind::TimedOut)
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl TcpTransportConfig {
    fn local_address(&self, remote: &SocketAddr) -> Option<SocketAddr> {
        match remote {
            SocketAddr::V4(_) => self.local_address_ipv4.map(|ip| SocketAddr::new(ip.into(), 0)),
            SocketAddr::V6(_) => self.local_address_ipv6.map(|ip| SocketAddr::new(ip.into(), 0)),
        }
    }

    /// Apply socket options. Failures here are logged and otherwise ignored.
    fn apply(&self, socket: &TcpSocket) {
        let options: [(&str, Option<io::Result<()>>); 3] = [
            ("reuseaddr", self.reuse_address.then(|| socket.set_reuseaddr(true))),
            (
                "send buffer",
                self.send_buffer_size.map(|size| socket.set_send_buffer_size(size)),
            ),
            (
                "recv buffer",
                self.recv_buffer_size.map(|size| socket.set_recv_buffer_size(size)),
            ),
        ];

        for (option, result) in options {
            if let Some(Err(error)) = result {
                warn!(%option, %error, "unable to set socket option");
            }
        }
    }
}

async fn connect(
    remote: SocketAddr,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(TcpConnectionError::msg("tcp open error"))?;

    config.apply(&socket);
    if let Some(local) = config.local_address(&remote) {
        socket
            .bind(local)
            .map_err(TcpConnectionError::msg("tcp bind local address"))?;
    }

    let attempt = socket.connect(remote);
    let result = if let Some(limit) = config.connect_timeout {
        tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or_else(|elapsed| {
                trace!(timeout = ?limit, "connection timed out");
                Err(io::Error::new(io::ErrorKind::TimedOut, elapsed))
            })
    } else {
        attempt.await
    };
    let stream = result.map_err(TcpConnectionError::msg("tcp connect error"))?;

    if let Err(error) = stream.set_nodelay(config.nodelay) {
        warn!(%error, "unable to set nodelay");
    }

    Ok(stream)
}
