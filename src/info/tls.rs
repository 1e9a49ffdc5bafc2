//! Information about a TLS connection.
//!
//! TLS information is only available once the handshake is complete, so
//! transports report `None` until a [`TlsStrategy`](crate::conn::TlsStrategy)
//! has upgraded the connection.

use super::HasConnectionInfo;
use crate::info::Protocol;

/// Information about a TLS connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConnectionInfo {
    /// The server name used for this connection, as sent in the SNI
    /// extension.
    pub server_name: Option<String>,

    /// Whether the server name was validated against the certificate.
    pub validated_server_name: bool,

    /// The application layer protocol negotiated for this connection.
    pub alpn: Option<Protocol>,
}

impl TlsConnectionInfo {
    /// TLS details for a client connection which negotiated `alpn`.
    pub fn new(server_name: Option<String>, alpn: Option<Protocol>) -> Self {
        Self {
            server_name,
            validated_server_name: false,
            alpn,
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn client(client_info: &rustls::ClientConnection, server_name: &str) -> Self {
        let alpn = client_info
            .alpn_protocol()
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse().ok());

        Self {
            server_name: Some(server_name.to_owned()).filter(|s| !s.is_empty()),
            validated_server_name: true,
            alpn,
        }
    }

    /// Did ALPN select HTTP/2?
    pub fn negotiated_h2(&self) -> bool {
        self.alpn.as_ref().is_some_and(Protocol::is_h2)
    }
}

/// A trait for types that can provide information about a TLS connection.
pub trait HasTlsConnectionInfo: HasConnectionInfo {
    /// Returns information about the TLS connection, if the connection
    /// is encrypted and the handshake has completed.
    fn tls_info(&self) -> Option<&TlsConnectionInfo>;
}

impl HasTlsConnectionInfo for tokio::net::TcpStream {
    fn tls_info(&self) -> Option<&TlsConnectionInfo> {
        None
    }
}

impl HasTlsConnectionInfo for tokio::io::DuplexStream {
    fn tls_info(&self) -> Option<&TlsConnectionInfo> {
        None
    }
}
