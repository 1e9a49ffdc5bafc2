//! A type-erased connected stream.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::info::{ConnectionInfo, HasConnectionInfo, HasTlsConnectionInfo, TlsConnectionInfo};

/// Byte streams a transport may produce.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A connected transport stream, with the connection's addresses and, once
/// upgraded, its TLS details.
pub struct Stream {
    io: Box<dyn Io>,
    info: ConnectionInfo,
    tls: Option<TlsConnectionInfo>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("info", &self.info)
            .field("tls", &self.tls)
            .finish()
    }
}

impl Stream {
    /// Erase a plaintext transport stream.
    pub fn new<IO>(io: IO) -> Self
    where
        IO: Io + HasConnectionInfo,
    {
        let info = io.info();
        Self::from_parts(io, info, None)
    }

    /// Build a stream from its parts, typically after a TLS upgrade.
    pub fn from_parts<IO: Io>(io: IO, info: ConnectionInfo, tls: Option<TlsConnectionInfo>) -> Self {
        Self {
            io: Box::new(io),
            info,
            tls,
        }
    }

    /// Has this stream been upgraded to TLS?
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl HasConnectionInfo for Stream {
    fn info(&self) -> ConnectionInfo {
        self.info
    }
}

impl HasTlsConnectionInfo for Stream {
    fn tls_info(&self) -> Option<&TlsConnectionInfo> {
        self.tls.as_ref()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::info::Addr;

    static_assertions::assert_impl_all!(Stream: Send, Unpin, AsyncRead, AsyncWrite);

    #[tokio::test]
    async fn erased_duplex() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = Stream::new(client);
        assert_eq!(*stream.info().remote_addr(), Addr::Duplex);
        assert!(!stream.is_tls());
        assert!(stream.tls_info().is_none());

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn tls_parts() {
        let (client, _server) = tokio::io::duplex(64);
        let tls = TlsConnectionInfo::new(Some("example.com".into()), Some("h2".parse().unwrap()));
        let stream = Stream::from_parts(client, ConnectionInfo::default(), Some(tls));
        assert!(stream.is_tls());
        assert!(stream.tls_info().unwrap().negotiated_h2());
    }
}
