//! TLS upgrade of connected transports.
//!
//! A [`TlsStrategy`] wraps a plaintext [`Stream`] in TLS, offering the ALPN
//! protocols allowed by the [`VersionPolicy`], and records the outcome of the
//! handshake in the stream's [`TlsConnectionInfo`](crate::info::TlsConnectionInfo).

use std::sync::Arc;

use super::Stream;
use crate::{BoxError, BoxFuture, Target, VersionPolicy};

/// Upgrades connected streams to TLS.
pub trait TlsStrategy: Send + Sync + 'static {
    /// Perform the TLS handshake for `target` over `stream`.
    fn upgrade(
        &self,
        stream: Stream,
        target: &Target,
        policy: VersionPolicy,
    ) -> BoxFuture<'static, Result<Stream, BoxError>>;
}

impl<T: TlsStrategy + ?Sized> TlsStrategy for Arc<T> {
    fn upgrade(
        &self,
        stream: Stream,
        target: &Target,
        policy: VersionPolicy,
    ) -> BoxFuture<'static, Result<Stream, BoxError>> {
        (**self).upgrade(stream, target, policy)
    }
}

#[cfg(feature = "tls")]
pub use self::rustls_strategy::RustlsStrategy;

#[cfg(feature = "tls")]
mod rustls_strategy {
    use std::fmt;
    use std::sync::Arc;

    use rustls::pki_types::ServerName;
    use rustls::ClientConfig;
    use tracing::{trace, Instrument};

    use super::TlsStrategy;
    use crate::conn::Stream;
    use crate::info::{HasConnectionInfo, TlsConnectionInfo};
    use crate::{BoxError, BoxFuture, Target, VersionPolicy};

    /// TLS with [`rustls`].
    ///
    /// The ALPN protocols of the supplied configuration are replaced with the
    /// ones offered by each [`VersionPolicy`].
    #[derive(Clone)]
    pub struct RustlsStrategy {
        http1: Arc<ClientConfig>,
        http2: Arc<ClientConfig>,
        negotiate: Arc<ClientConfig>,
    }

    impl fmt::Debug for RustlsStrategy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RustlsStrategy").finish()
        }
    }

    impl RustlsStrategy {
        /// Use `config` for every handshake.
        pub fn new(config: ClientConfig) -> Self {
            let with_alpn = |policy: VersionPolicy| {
                let mut config = config.clone();
                config.alpn_protocols = policy.alpn_protocols();
                Arc::new(config)
            };

            Self {
                http1: with_alpn(VersionPolicy::ForceHttp1),
                http2: with_alpn(VersionPolicy::ForceHttp2),
                negotiate: with_alpn(VersionPolicy::Negotiate),
            }
        }

        /// Trust the platform's root certificates.
        ///
        /// Certificates the platform store returns but rustls cannot parse are
        /// skipped; the strategy fails only if no root could be loaded.
        pub fn with_native_roots() -> Result<Self, BoxError> {
            let mut roots = rustls::RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                tracing::debug!(%error, "error loading platform certificate");
            }

            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            trace!(added, ignored, "loaded platform roots");
            if roots.is_empty() {
                return Err("no platform root certificates could be loaded".into());
            }

            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Self::new(config))
        }

        pub(super) fn config(&self, policy: VersionPolicy) -> Arc<ClientConfig> {
            match policy {
                VersionPolicy::ForceHttp1 => self.http1.clone(),
                VersionPolicy::ForceHttp2 => self.http2.clone(),
                VersionPolicy::Negotiate => self.negotiate.clone(),
            }
        }
    }

    impl TlsStrategy for RustlsStrategy {
        fn upgrade(
            &self,
            stream: Stream,
            target: &Target,
            policy: VersionPolicy,
        ) -> BoxFuture<'static, Result<Stream, BoxError>> {
            let host = target.address().0.to_owned();
            let connector = tokio_rustls::TlsConnector::from(self.config(policy));
            let span = tracing::trace_span!("tls", %host, %policy);

            Box::pin(
                async move {
                    let domain = ServerName::try_from(host.clone())?;
                    let info = stream.info();
                    let tls = connector.connect(domain, stream).await?;
                    let tls_info = TlsConnectionInfo::client(tls.get_ref().1, &host);
                    trace!(alpn = ?tls_info.alpn, "tls handshake complete");
                    Ok(Stream::from_parts(tls, info, Some(tls_info)))
                }
                .instrument(span),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::TlsConnectionInfo;

    /// Pretends to upgrade, reporting a fixed ALPN outcome.
    struct FakeTls(Option<&'static str>);

    impl TlsStrategy for FakeTls {
        fn upgrade(
            &self,
            stream: Stream,
            target: &Target,
            _policy: VersionPolicy,
        ) -> BoxFuture<'static, Result<Stream, BoxError>> {
            let info = crate::info::HasConnectionInfo::info(&stream);
            let tls = TlsConnectionInfo::new(
                Some(target.host().to_owned()),
                self.0.map(|alpn| alpn.parse().unwrap()),
            );
            Box::pin(async move { Ok(Stream::from_parts(stream, info, Some(tls))) })
        }
    }

    #[tokio::test]
    async fn strategy_through_arc() {
        let strategy: Arc<dyn TlsStrategy> = Arc::new(FakeTls(Some("h2")));
        let (client, _server) = tokio::io::duplex(64);
        let target: Target = "https://example.com".parse().unwrap();

        let stream = strategy
            .upgrade(Stream::new(client), &target, VersionPolicy::Negotiate)
            .await
            .unwrap();
        let tls = crate::info::HasTlsConnectionInfo::tls_info(&stream).unwrap();
        assert!(tls.negotiated_h2());
        assert_eq!(tls.server_name.as_deref(), Some("example.com"));
    }

    #[cfg(all(feature = "tls", any(feature = "tls-ring", feature = "tls-aws-lc")))]
    #[test]
    fn rustls_alpn_per_policy() {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let strategy = RustlsStrategy::new(config);
        assert_eq!(
            strategy.config(VersionPolicy::Negotiate).alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(
            strategy.config(VersionPolicy::ForceHttp1).alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }
}
