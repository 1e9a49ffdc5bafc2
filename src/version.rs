//! HTTP version selection for new connections.
//!
//! The [`VersionPolicy`] is consulted twice while a connection is being
//! established: when choosing which ALPN protocols to offer during the TLS
//! handshake, and once the connection is ready, to decide whether it should
//! speak HTTP/1.1 or HTTP/2.

use std::fmt;

use crate::info::{Protocol, TlsConnectionInfo};

/// Which HTTP version a requester should use for new connections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionPolicy {
    /// Always speak HTTP/1.1.
    ForceHttp1,

    /// Always speak HTTP/2, regardless of the ALPN outcome.
    ForceHttp2,

    /// Speak HTTP/2 if the TLS handshake selected `h2`, HTTP/1.1 otherwise.
    #[default]
    Negotiate,
}

impl VersionPolicy {
    /// ALPN protocol identifiers to offer during the TLS handshake, in
    /// preference order.
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        match self {
            VersionPolicy::ForceHttp1 => vec![Protocol::HTTP_11.as_bytes().to_vec()],
            VersionPolicy::ForceHttp2 => vec![Protocol::H2.as_bytes().to_vec()],
            VersionPolicy::Negotiate => vec![
                Protocol::H2.as_bytes().to_vec(),
                Protocol::HTTP_11.as_bytes().to_vec(),
            ],
        }
    }

    /// Decide the protocol for a connection whose TLS handshake (if any)
    /// has completed.
    ///
    /// `tls` is `None` for plaintext connections, which under
    /// [`VersionPolicy::Negotiate`] never carry an HTTP/2 signal.
    pub fn select(&self, tls: Option<&TlsConnectionInfo>) -> HttpProtocol {
        match self {
            VersionPolicy::ForceHttp2 => HttpProtocol::Http2,
            VersionPolicy::Negotiate => match tls {
                Some(info) if info.negotiated_h2() => HttpProtocol::Http2,
                _ => HttpProtocol::Http1,
            },
            VersionPolicy::ForceHttp1 => HttpProtocol::Http1,
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPolicy::ForceHttp1 => f.write_str("force-http/1.1"),
            VersionPolicy::ForceHttp2 => f.write_str("force-h2"),
            VersionPolicy::Negotiate => f.write_str("negotiate"),
        }
    }
}

/// The HTTP protocol spoken on an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpProtocol {
    /// HTTP/1.1, one exchange at a time.
    Http1,

    /// HTTP/2, multiplexed streams.
    Http2,
}

impl HttpProtocol {
    /// Does the protocol support multiplexing?
    pub fn multiplex(&self) -> bool {
        matches!(self, Self::Http2)
    }

    /// HTTP Version to use for the protocol.
    pub fn version(&self) -> http::Version {
        match self {
            Self::Http1 => http::Version::HTTP_11,
            Self::Http2 => http::Version::HTTP_2,
        }
    }
}

impl From<http::Version> for HttpProtocol {
    fn from(version: http::Version) -> Self {
        match version {
            http::Version::HTTP_2 => Self::Http2,
            _ => Self::Http1,
        }
    }
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http1 => f.write_str("HTTP/1.1"),
            Self::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// How a connector turns a [`VersionPolicy`] into a protocol for each new
/// connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolNegotiator {
    /// Apply the version policy to the outcome of the TLS handshake.
    #[default]
    Policy,

    /// HTTP/2 with prior knowledge: every connection speaks HTTP/2 and the
    /// TLS details are never inspected.
    PriorKnowledge,
}

impl ProtocolNegotiator {
    /// Choose the protocol for a connection.
    pub fn negotiate(
        &self,
        policy: VersionPolicy,
        tls: Option<&TlsConnectionInfo>,
    ) -> HttpProtocol {
        let protocol = match self {
            ProtocolNegotiator::PriorKnowledge => HttpProtocol::Http2,
            ProtocolNegotiator::Policy => policy.select(tls),
        };
        tracing::trace!(%policy, negotiator = ?self, %protocol, "selected protocol");
        protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alpn(token: &str) -> TlsConnectionInfo {
        TlsConnectionInfo::new(None, Some(token.parse().unwrap()))
    }

    #[test]
    fn force_http2_ignores_alpn() {
        let policy = VersionPolicy::ForceHttp2;
        assert_eq!(policy.select(None), HttpProtocol::Http2);
        assert_eq!(policy.select(Some(&alpn("http/1.1"))), HttpProtocol::Http2);
        assert_eq!(policy.select(Some(&alpn("h2"))), HttpProtocol::Http2);
        assert_eq!(
            policy.select(Some(&TlsConnectionInfo::default())),
            HttpProtocol::Http2
        );
    }

    #[test]
    fn force_http1_never_switches() {
        let policy = VersionPolicy::ForceHttp1;
        assert_eq!(policy.select(None), HttpProtocol::Http1);
        assert_eq!(policy.select(Some(&alpn("h2"))), HttpProtocol::Http1);
        assert_eq!(policy.select(Some(&alpn("http/1.1"))), HttpProtocol::Http1);
    }

    #[test]
    fn negotiate_follows_alpn() {
        let policy = VersionPolicy::Negotiate;
        assert_eq!(policy.select(Some(&alpn("h2"))), HttpProtocol::Http2);
        assert_eq!(policy.select(Some(&alpn("http/1.1"))), HttpProtocol::Http1);
        assert_eq!(policy.select(Some(&alpn("h2c"))), HttpProtocol::Http1);
        assert_eq!(
            policy.select(Some(&TlsConnectionInfo::default())),
            HttpProtocol::Http1
        );
        assert_eq!(policy.select(None), HttpProtocol::Http1, "plaintext");
    }

    #[test]
    fn prior_knowledge_skips_tls() {
        let negotiator = ProtocolNegotiator::PriorKnowledge;
        for policy in [
            VersionPolicy::ForceHttp1,
            VersionPolicy::ForceHttp2,
            VersionPolicy::Negotiate,
        ] {
            assert_eq!(negotiator.negotiate(policy, None), HttpProtocol::Http2);
            assert_eq!(
                negotiator.negotiate(policy, Some(&alpn("http/1.1"))),
                HttpProtocol::Http2
            );
        }
    }

    #[test]
    fn alpn_offers() {
        assert_eq!(
            VersionPolicy::Negotiate.alpn_protocols(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(VersionPolicy::ForceHttp2.alpn_protocols(), vec![b"h2".to_vec()]);
        assert_eq!(
            VersionPolicy::ForceHttp1.alpn_protocols(),
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn protocol_versions() {
        assert!(HttpProtocol::Http2.multiplex());
        assert!(!HttpProtocol::Http1.multiplex());
        assert_eq!(HttpProtocol::from(http::Version::HTTP_2), HttpProtocol::Http2);
        assert_eq!(HttpProtocol::Http1.version(), http::Version::HTTP_11);
    }
}
