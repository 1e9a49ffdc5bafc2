use std::fmt;
use std::time::Duration;

use super::Requester;
use crate::conn::tcp::{TcpTransport, TcpTransportConfig};
use crate::conn::{HttpConnector, TlsStrategy, Transport};
use crate::h2::{self, CodecFactory, FrameListener, SubmissionPolicy};
use crate::pool::{self, Pool};
use crate::version::ProtocolNegotiator;
use crate::VersionPolicy;

/// A builder for a [`Requester`].
pub struct Builder<T = TcpTransport> {
    connector: HttpConnector<T>,
    policy: VersionPolicy,
    prior_knowledge: bool,
    pool: pool::Config,
    timeout: Option<Duration>,
}

impl<T: fmt::Debug> fmt::Debug for Builder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("connector", &self.connector)
            .field("policy", &self.policy)
            .field("prior_knowledge", &self.prior_knowledge)
            .field("pool", &self.pool)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new(TcpTransport::default())
    }
}

impl<T> Builder<T> {
    /// Create a builder which connects over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            connector: HttpConnector::new(transport),
            policy: VersionPolicy::default(),
            prior_knowledge: false,
            pool: pool::Config::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Use the provided TCP configuration.
    pub fn with_tcp(self, config: TcpTransportConfig) -> Builder<TcpTransport> {
        self.with_transport(TcpTransport::new(config))
    }

    /// Provide a custom transport.
    pub fn with_transport<T2>(self, transport: T2) -> Builder<T2> {
        Builder {
            connector: self.connector.with_transport(transport),
            policy: self.policy,
            prior_knowledge: self.prior_knowledge,
            pool: self.pool,
            timeout: self.timeout,
        }
    }

    /// Upgrade `https` targets with `tls`.
    pub fn with_tls<S: TlsStrategy>(mut self, tls: S) -> Self {
        self.connector = self.connector.with_tls(tls);
        self
    }

    /// Upgrade `https` targets with rustls, trusting the platform's root
    /// certificates.
    #[cfg(feature = "tls")]
    pub fn with_default_tls(self) -> Result<Self, crate::BoxError> {
        Ok(self.with_tls(crate::conn::RustlsStrategy::with_native_roots()?))
    }

    /// Set the default version policy.
    pub fn with_version_policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Speak HTTP/2 on every connection without negotiating.
    pub fn with_prior_knowledge(mut self, enabled: bool) -> Self {
        self.prior_knowledge = enabled;
        self
    }

    /// Use the provided connection pool configuration.
    pub fn with_pool(mut self, config: pool::Config) -> Self {
        self.pool = config;
        self
    }

    /// Connection pool configuration.
    pub fn pool(&mut self) -> &mut pool::Config {
        &mut self.pool
    }

    /// Set the cap on sessions per route.
    pub fn with_max_per_route(mut self, max: usize) -> Self {
        self.pool.max_per_route = max;
        self
    }

    /// Set the cap on sessions across routes.
    pub fn with_max_total(mut self, max: usize) -> Self {
        self.pool.max_total = max;
        self
    }

    /// Set the session time to live.
    pub fn with_time_to_live(mut self, ttl: Option<Duration>) -> Self {
        self.pool.time_to_live = ttl;
        self
    }

    /// Use the provided HTTP/2 configuration.
    pub fn with_http2(mut self, config: h2::Config) -> Self {
        self.connector = self.connector.with_http2(config);
        self
    }

    /// Set the behavior of HTTP/2 sessions at their stream limit.
    pub fn with_submission_policy(mut self, policy: SubmissionPolicy) -> Self {
        let config = self.connector.http2().clone().with_submission_policy(policy);
        self.connector = self.connector.with_http2(config);
        self
    }

    /// Configure the HTTP/1.1 handshake.
    pub fn with_http1(mut self, builder: hyper::client::conn::http1::Builder) -> Self {
        self.connector = self.connector.with_http1(builder);
        self
    }

    /// Frame HTTP/2 connections with `codec`.
    pub fn with_codec<F: CodecFactory>(mut self, codec: F) -> Self {
        self.connector = self.connector.with_codec(codec);
        self
    }

    /// Observe HTTP/2 frames with `listener`.
    pub fn with_listener<L: FrameListener>(mut self, listener: L) -> Self {
        self.connector = self.connector.with_listener(listener);
        self
    }

    /// Bound the wait for a session in [`Requester::send`].
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the requester.
    pub fn build(self) -> Requester<HttpConnector<T>>
    where
        T: Transport,
    {
        let negotiator = if self.prior_knowledge {
            ProtocolNegotiator::PriorKnowledge
        } else {
            ProtocolNegotiator::Policy
        };
        let connector = self.connector.with_negotiator(negotiator);
        Requester::new(Pool::new(connector, self.pool), self.policy, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_default() {
        let requester = Builder::default()
            .with_version_policy(VersionPolicy::ForceHttp1)
            .with_max_per_route(3)
            .with_submission_policy(SubmissionPolicy::Queue)
            .build();

        assert_eq!(requester.version_policy(), VersionPolicy::ForceHttp1);
        let target = "http://example.com".parse().unwrap();
        assert_eq!(requester.pool().max_per_route(&target), 3);
    }

    #[test]
    fn pool_config_is_mutable() {
        let mut builder = Builder::default();
        builder.pool().max_total = 7;
        assert_eq!(builder.pool.max_total, 7);
    }
}
