//! Connection Information
//!
//! Address details and negotiated protocol identifiers for physical
//! connections, as reported by transports and TLS strategies.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

pub mod tls;
pub use self::tls::{HasTlsConnectionInfo, TlsConnectionInfo};

/// An application protocol identifier, as negotiated by ALPN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Protocol {
    /// HTTP transports
    Http(http::Version),

    /// Other protocol
    Other(String),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // http::Version uses the debug format to write out the version
            Self::Http(version) => write!(f, "{version:?}"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

impl Protocol {
    /// ALPN token for HTTP/2 over TLS.
    pub const H2: &'static str = "h2";

    /// ALPN token for HTTP/1.1.
    pub const HTTP_11: &'static str = "http/1.1";

    /// Create a new protocol with the given http version.
    pub fn http(version: http::Version) -> Self {
        Self::Http(version)
    }

    /// Is this the HTTP/2 protocol?
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::Http(version) if *version == http::Version::HTTP_2)
    }

    /// The ALPN wire token for this protocol, if it has one.
    pub fn alpn(&self) -> Option<&str> {
        match self {
            Self::Http(version) if *version == http::Version::HTTP_2 => Some(Self::H2),
            Self::Http(version) if *version == http::Version::HTTP_11 => Some(Self::HTTP_11),
            Self::Http(_) => None,
            Self::Other(token) => Some(token),
        }
    }
}

impl From<http::Version> for Protocol {
    fn from(version: http::Version) -> Self {
        Self::Http(version)
    }
}

impl FromStr for Protocol {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http/1.0" => Ok(Self::Http(http::Version::HTTP_10)),
            "http/1.1" => Ok(Self::Http(http::Version::HTTP_11)),
            "h2" => Ok(Self::Http(http::Version::HTTP_2)),
            _ => Ok(Self::Other(s.to_string())),
        }
    }
}

/// The address of one end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Addr {
    /// A TCP socket address.
    Tcp(SocketAddr),

    /// An in-memory duplex connection, which has no address.
    Duplex,
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Duplex => write!(f, "<duplex>"),
        }
    }
}

impl Addr {
    /// Returns the TCP socket address, if this is a TCP socket address.
    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            Self::Duplex => None,
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

/// Local and remote addresses of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    /// Our end of the connection.
    pub local_addr: Addr,

    /// The peer's end of the connection.
    pub remote_addr: Addr,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            local_addr: Addr::Duplex,
            remote_addr: Addr::Duplex,
        }
    }
}

impl ConnectionInfo {
    /// Connection info for a TCP stream.
    pub fn tcp(stream: &tokio::net::TcpStream) -> io::Result<Self> {
        Ok(Self {
            local_addr: stream.local_addr()?.into(),
            remote_addr: stream.peer_addr()?.into(),
        })
    }

    /// The local address.
    pub fn local_addr(&self) -> &Addr {
        &self.local_addr
    }

    /// The remote address.
    pub fn remote_addr(&self) -> &Addr {
        &self.remote_addr
    }
}

/// Types which can report the addresses of the connection they carry.
pub trait HasConnectionInfo {
    /// Address information for this connection.
    fn info(&self) -> ConnectionInfo;
}

impl HasConnectionInfo for tokio::net::TcpStream {
    fn info(&self) -> ConnectionInfo {
        match ConnectionInfo::tcp(self) {
            Ok(info) => info,
            Err(error) => {
                tracing::debug!("unable to read tcp addresses: {error}");
                ConnectionInfo::default()
            }
        }
    }
}

impl HasConnectionInfo for tokio::io::DuplexStream {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo::default()
    }
}

impl<T> HasConnectionInfo for Box<T>
where
    T: HasConnectionInfo + ?Sized,
{
    fn info(&self) -> ConnectionInfo {
        (**self).info()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use http::Version;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[test]
    fn protocol_display() {
        assert_eq!(Protocol::http(Version::HTTP_11).to_string(), "HTTP/1.1");
        assert_eq!(Protocol::http(Version::HTTP_2).to_string(), "HTTP/2.0");
        assert_eq!(Protocol::Other("spdy/3".into()).to_string(), "spdy/3");
    }

    #[test]
    fn parse_protocol() {
        assert_eq!(
            Protocol::from_str("http/1.1").unwrap(),
            Protocol::http(Version::HTTP_11)
        );
        assert_eq!(
            Protocol::from_str("h2").unwrap(),
            Protocol::http(Version::HTTP_2)
        );
        assert_eq!(
            Protocol::from_str("h2c").unwrap(),
            Protocol::Other("h2c".into())
        );
        assert!(Protocol::from_str("h2").unwrap().is_h2());
        assert!(!Protocol::from_str("http/1.1").unwrap().is_h2());
    }

    #[test]
    fn alpn_tokens() {
        assert_eq!(Protocol::http(Version::HTTP_2).alpn(), Some("h2"));
        assert_eq!(Protocol::http(Version::HTTP_11).alpn(), Some("http/1.1"));
        assert_eq!(Protocol::http(Version::HTTP_10).alpn(), None);
    }

    #[test]
    fn connection_info_default() {
        let info = ConnectionInfo::default();

        assert_eq!(info.local_addr(), &Addr::Duplex);
        assert_eq!(info.remote_addr().to_string(), "<duplex>");
    }

    #[tokio::test]
    async fn tcp_connection_info() {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = TcpStream::connect(addr).await.unwrap();

        let info = conn.info();
        assert_eq!(info.remote_addr().tcp(), Some(addr));
    }
}
