//! The requester: submits exchanges to pooled sessions.
//!
//! A [`Requester`] takes an [`ExchangeHandler`], resolves the target of the
//! request it produces, leases a session for that target from its
//! [`Pool`], and queues the exchange on the session. The handler is wrapped
//! so that the lease is released exactly once when the exchange is over, and
//! so that the [`CancellableHandle`] returned to the caller follows the
//! exchange from the lease to the stream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use tracing::{debug, trace, Instrument};

use crate::cancel::CancellableHandle;
use crate::conn::{Connect, HttpConnector};
use crate::exchange::{
    BasicExchange, BytesRequest, BytesResponse, CapacityChannel, DataChannel, ExchangeHandler,
    HttpContext, PushHandlerFactory, RequestHead, RequestProducer, ResponseConsumer,
    ResponseFuture,
};
use crate::pool::{Leased, Pool, PoolableSession};
use crate::session::{CloseMode, Command, ExecutableCommand, Priority, Session};
use crate::{Error, ErrorKind, Target, TargetError, VersionPolicy};

mod builder;
pub use self::builder::Builder;

/// Submits exchanges to pooled sessions.
///
/// Clones share the pool.
pub struct Requester<C: Connect = HttpConnector> {
    pool: Pool<C>,
    policy: VersionPolicy,
    timeout: Option<Duration>,
}

impl<C: Connect> Clone for Requester<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            policy: self.policy,
            timeout: self.timeout,
        }
    }
}

impl<C: Connect> fmt::Debug for Requester<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Requester {
    /// A builder for a requester over TCP.
    pub fn builder() -> Builder {
        Builder::default()
    }
}

impl<C: Connect> Requester<C> {
    /// Create a requester leasing sessions from `pool`.
    ///
    /// `policy` applies to exchanges whose context does not override it, and
    /// `timeout` bounds the wait for a session in [`Requester::send`].
    pub fn new(pool: Pool<C>, policy: VersionPolicy, timeout: Option<Duration>) -> Self {
        Self {
            pool,
            policy,
            timeout,
        }
    }

    /// The session pool.
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// The default version policy.
    pub fn version_policy(&self) -> VersionPolicy {
        self.policy
    }

    /// Execute an exchange.
    ///
    /// The handler's request head is produced right away to find the
    /// target. A session is then leased (waiting at most `timeout`) and the
    /// exchange is queued on it. Every outcome, including failing to
    /// resolve the target or to lease a session, is reported through the
    /// handler.
    ///
    /// Cancelling the returned handle cancels the lease while it is
    /// pending, and the stream once it is open.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute<H>(
        &self,
        handler: H,
        push_factory: Option<Arc<dyn PushHandlerFactory>>,
        timeout: Option<Duration>,
        context: HttpContext,
    ) -> CancellableHandle
    where
        H: ExchangeHandler,
    {
        self.submit(Box::new(handler), push_factory, timeout, context)
    }

    fn submit(
        &self,
        mut handler: Box<dyn ExchangeHandler>,
        push_factory: Option<Arc<dyn PushHandlerFactory>>,
        timeout: Option<Duration>,
        mut context: HttpContext,
    ) -> CancellableHandle {
        let handle = CancellableHandle::new();

        let head = match handler.produce_request(&mut context) {
            Ok(head) => head,
            Err(error) => {
                debug!(%error, "request could not be produced");
                abort(handler, &handle, error);
                return handle;
            }
        };

        let target = match Target::try_from(&head.parts) {
            Ok(target) => target,
            Err(TargetError::MissingAuthority(_)) => {
                abort(handler, &handle, Error::MissingAuthority);
                return handle;
            }
            Err(error) => {
                abort(handler, &handle, error.into());
                return handle;
            }
        };

        let policy = context.version_policy().unwrap_or(self.policy);
        let span = tracing::debug_span!("execute", %target, %policy);
        let lease = {
            let _entered = span.enter();
            self.pool.lease(target, policy, timeout)
        };
        handle.set_dependency(Box::new(lease.canceller()));

        let cancellable = handle.clone();
        tokio::spawn(
            async move {
                match lease.await {
                    Ok(leased) => {
                        trace!(session = %leased.session().id(), "leased session");
                        let session = leased.session().clone();
                        let handler = ReleasingHandler::new(handler, head, leased, cancellable.clone());
                        let command = ExecutableCommand::new(
                            Box::new(handler),
                            push_factory,
                            cancellable,
                            context,
                        );
                        session.enqueue(Command::Execute(Box::new(command)), Priority::Normal);
                    }
                    Err(error) => {
                        debug!(%error, "lease failed");
                        abort(handler, &cancellable, error);
                    }
                }
            }
            .instrument(span),
        );

        handle
    }

    /// Execute an exchange built from a request producer and a response
    /// consumer, resolving to the consumer's output.
    pub fn execute_with<P, R>(
        &self,
        producer: P,
        consumer: R,
        timeout: Option<Duration>,
        context: HttpContext,
    ) -> ResponseFuture<R::Output>
    where
        P: RequestProducer,
        R: ResponseConsumer,
    {
        let (exchange, rx) = BasicExchange::new(producer, consumer);
        let handle = self.execute(exchange, None, timeout, context);
        ResponseFuture::new(rx, handle)
    }

    /// Send a request with an in-memory body and buffer the response.
    pub fn send(&self, request: http::Request<Bytes>) -> ResponseFuture<http::Response<Bytes>> {
        self.execute_with(
            BytesRequest::new(request),
            BytesResponse::new(),
            self.timeout,
            HttpContext::new(),
        )
    }

    /// Close the pool. Waiting exchanges fail, and sessions in use close
    /// once their exchanges are released.
    pub fn close(&self, mode: CloseMode) {
        self.pool.shutdown(mode);
    }
}

/// Report an exchange which never reached a session.
fn abort(mut handler: Box<dyn ExchangeHandler>, handle: &CancellableHandle, error: Error) {
    if error.is_cancelled() {
        handler.cancel();
    } else {
        handler.failed(error);
    }
    handler.release_resources();
    handle.complete();
}

/// Wraps a submitted handler for the session it runs on.
///
/// Replays the request head captured at submission, and on release hands the
/// lease back to the pool. Everything else is delegated unchanged.
struct ReleasingHandler<S: PoolableSession> {
    inner: Box<dyn ExchangeHandler>,
    head: Option<RequestHead>,
    lease: Option<Leased<S>>,
    handle: CancellableHandle,
    reusable: bool,
}

impl<S: PoolableSession> ReleasingHandler<S> {
    fn new(
        inner: Box<dyn ExchangeHandler>,
        head: RequestHead,
        lease: Leased<S>,
        handle: CancellableHandle,
    ) -> Self {
        Self {
            inner,
            head: Some(head),
            lease: Some(lease),
            handle,
            reusable: true,
        }
    }

    fn release(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        self.inner.release_resources();
        self.handle.complete();
        trace!(reusable = self.reusable, "releasing session");
        lease.release(self.reusable);
    }
}

impl<S: PoolableSession> ExchangeHandler for ReleasingHandler<S> {
    fn produce_request(&mut self, _context: &mut HttpContext) -> Result<RequestHead, Error> {
        self.head
            .take()
            .ok_or_else(|| Error::protocol("request head already produced"))
    }

    fn available(&self) -> usize {
        self.inner.available()
    }

    fn produce(&mut self, channel: &mut DataChannel) -> Result<(), Error> {
        self.inner.produce(channel)
    }

    fn consume_information(&mut self, response: &http::response::Parts) -> Result<(), Error> {
        self.inner.consume_information(response)
    }

    fn consume_response(
        &mut self,
        response: http::response::Parts,
        end_stream: bool,
    ) -> Result<(), Error> {
        self.inner.consume_response(response, end_stream)
    }

    fn update_capacity(&mut self, channel: &mut CapacityChannel) {
        self.inner.update_capacity(channel)
    }

    fn consume(&mut self, data: Bytes) -> Result<(), Error> {
        self.inner.consume(data)
    }

    fn stream_end(&mut self, trailers: Option<HeaderMap>) -> Result<(), Error> {
        self.inner.stream_end(trailers)
    }

    fn cancel(&mut self) {
        // A cancelled exclusive session may be mid-message.
        if self.lease.as_ref().is_some_and(|lease| !lease.is_shared()) {
            self.reusable = false;
        }
        self.inner.cancel()
    }

    fn failed(&mut self, error: Error) {
        if matches!(error.kind(), ErrorKind::Connection | ErrorKind::Timeout) {
            self.reusable = false;
        }
        self.inner.failed(error)
    }

    fn release_resources(&mut self) {
        self.release()
    }
}

impl<S: PoolableSession> Drop for ReleasingHandler<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pool::mock::{MockConnector, MockSession};
    use crate::pool::Config;

    static_assertions::assert_impl_all!(Requester<MockConnector>: Clone, Send, Sync);

    #[derive(Debug, Default)]
    struct Calls {
        cancel: AtomicUsize,
        failed: AtomicUsize,
        release: AtomicUsize,
        last_error: parking_lot::Mutex<Option<Error>>,
    }

    struct Recording {
        request: Option<http::Request<()>>,
        calls: Arc<Calls>,
    }

    impl Recording {
        fn new(uri: &str) -> (Self, Arc<Calls>) {
            let calls = Arc::new(Calls::default());
            let request = http::Request::get(uri).body(()).unwrap();
            (
                Self {
                    request: Some(request),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl ExchangeHandler for Recording {
        fn produce_request(&mut self, _context: &mut HttpContext) -> Result<RequestHead, Error> {
            let request = self
                .request
                .take()
                .ok_or_else(|| Error::protocol("produced twice"))?;
            Ok(RequestHead::new(request.into_parts().0, false))
        }

        fn consume_response(&mut self, _: http::response::Parts, _: bool) -> Result<(), Error> {
            Ok(())
        }

        fn consume(&mut self, _data: Bytes) -> Result<(), Error> {
            Ok(())
        }

        fn stream_end(&mut self, _trailers: Option<HeaderMap>) -> Result<(), Error> {
            Ok(())
        }

        fn cancel(&mut self) {
            self.calls.cancel.fetch_add(1, Ordering::SeqCst);
        }

        fn failed(&mut self, error: Error) {
            self.calls.failed.fetch_add(1, Ordering::SeqCst);
            *self.calls.last_error.lock() = Some(error);
        }

        fn release_resources(&mut self) {
            self.calls.release.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn requester(connector: MockConnector, config: Config) -> Requester<MockConnector> {
        Requester::new(
            Pool::new(connector, config),
            VersionPolicy::Negotiate,
            None,
        )
    }

    async fn connected(connector: &MockConnector) -> MockSession {
        for _ in 0..100 {
            if let Some(session) = connector.sessions().pop() {
                return session;
            }
            tokio::task::yield_now().await;
        }
        panic!("never connected");
    }

    async fn queued(session: &MockSession) -> Vec<Command> {
        for _ in 0..100 {
            if session.queued() > 0 {
                return session.take_commands();
            }
            tokio::task::yield_now().await;
        }
        panic!("no command queued");
    }

    async fn settle(calls: &Calls) {
        for _ in 0..100 {
            if calls.release.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn exchange_is_queued_on_leased_session() {
        let _ = tracing_subscriber::fmt::try_init();
        let connector = MockConnector::exclusive();
        let requester = requester(connector.clone(), Config::default());

        let (handler, calls) = Recording::new("http://example.com/");
        let handle = requester.execute(handler, None, None, HttpContext::new());
        assert!(!handle.is_completed());

        let session = connected(&connector).await;
        let mut commands = queued(&session).await;
        let Some(Command::Execute(mut command)) = commands.pop() else {
            panic!("expected an exchange");
        };

        let head = command.handler.produce_request(&mut command.context).unwrap();
        assert_eq!(head.parts.uri, "http://example.com/");
        assert!(command.handler.produce_request(&mut command.context).is_err());

        let target: Target = "http://example.com".parse().unwrap();
        assert_eq!(requester.pool().stats(&target).leased, 1);

        command.handler.release_resources();
        command.handler.release_resources();
        drop(command);

        assert_eq!(calls.release.load(Ordering::SeqCst), 1);
        assert!(handle.is_completed());
        assert_eq!(requester.pool().stats(&target).available, 1);
    }

    #[tokio::test]
    async fn connection_failure_discards_session() {
        let connector = MockConnector::exclusive();
        let requester = requester(connector.clone(), Config::default());

        let (handler, _calls) = Recording::new("http://example.com/");
        requester.execute(handler, None, None, HttpContext::new());
        tokio::task::yield_now().await;

        let session = connector.sessions().pop().unwrap();
        let Some(Command::Execute(mut command)) = queued(&session).await.pop() else {
            panic!("expected an exchange");
        };
        command.handler.failed(Error::ConnectionClosed);
        command.handler.release_resources();

        assert!(!session.is_open());
        let target: Target = "http://example.com".parse().unwrap();
        assert_eq!(requester.pool().stats(&target).available, 0);
    }

    #[tokio::test]
    async fn cancelled_exchange_discards_exclusive_session() {
        let connector = MockConnector::exclusive();
        let requester = requester(connector.clone(), Config::default());

        let (handler, calls) = Recording::new("http://example.com/");
        requester.execute(handler, None, None, HttpContext::new());

        let session = connected(&connector).await;
        let Some(Command::Execute(mut command)) = queued(&session).await.pop() else {
            panic!("expected an exchange");
        };
        command.handler.cancel();
        command.handler.release_resources();

        assert_eq!(calls.cancel.load(Ordering::SeqCst), 1);
        assert!(!session.is_open());
        let target: Target = "http://example.com".parse().unwrap();
        assert_eq!(requester.pool().stats(&target).available, 0);
    }

    #[tokio::test]
    async fn cancelled_exchange_keeps_shared_session() {
        let connector = MockConnector::shared();
        let requester = requester(connector.clone(), Config::default());

        let (handler, _calls) = Recording::new("http://example.com/");
        requester.execute(handler, None, None, HttpContext::new());

        let session = connected(&connector).await;
        let Some(Command::Execute(mut command)) = queued(&session).await.pop() else {
            panic!("expected an exchange");
        };
        command.handler.cancel();
        command.handler.release_resources();

        assert!(session.is_open());
    }

    #[tokio::test]
    async fn missing_authority_fails_without_leasing() {
        let connector = MockConnector::exclusive();
        let requester = requester(connector.clone(), Config::default());

        let (handler, calls) = Recording::new("/relative");
        let handle = requester.execute(handler, None, None, HttpContext::new());

        assert!(handle.is_completed());
        assert_eq!(calls.failed.load(Ordering::SeqCst), 1);
        assert_eq!(calls.release.load(Ordering::SeqCst), 1);
        assert!(matches!(
            calls.last_error.lock().as_ref(),
            Some(Error::MissingAuthority)
        ));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_timeout_fails_handler() {
        let connector = MockConnector::exclusive();
        let requester = requester(connector.clone(), Config::default().with_max_per_route(1));
        let target: Target = "http://example.com".parse().unwrap();
        let _held = requester
            .pool()
            .lease(target, VersionPolicy::Negotiate, None)
            .await
            .unwrap();

        let (handler, calls) = Recording::new("http://example.com/");
        requester.execute(handler, None, Some(Duration::from_secs(5)), HttpContext::new());

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle(&calls).await;
        assert_eq!(calls.failed.load(Ordering::SeqCst), 1);
        assert_eq!(calls.release.load(Ordering::SeqCst), 1);
        let error = calls.last_error.lock().clone().unwrap();
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn cancel_while_leasing() {
        let connector = MockConnector::exclusive();
        let requester = requester(connector.clone(), Config::default().with_max_per_route(1));
        let target: Target = "http://example.com".parse().unwrap();
        let held = requester
            .pool()
            .lease(target.clone(), VersionPolicy::Negotiate, None)
            .await
            .unwrap();

        let (handler, calls) = Recording::new("http://example.com/");
        let handle = requester.execute(handler, None, None, HttpContext::new());
        assert!(handle.cancel());

        settle(&calls).await;
        assert_eq!(calls.cancel.load(Ordering::SeqCst), 1);
        assert_eq!(calls.failed.load(Ordering::SeqCst), 0);
        assert_eq!(calls.release.load(Ordering::SeqCst), 1);

        drop(held);
        assert_eq!(requester.pool().stats(&target).pending, 0);
        assert_eq!(requester.pool().stats(&target).available, 1);
    }

    #[tokio::test]
    async fn closed_requester_fails_exchanges() {
        let requester = requester(MockConnector::exclusive(), Config::default());
        requester.close(CloseMode::Graceful);

        let (handler, calls) = Recording::new("http://example.com/");
        requester.execute(handler, None, None, HttpContext::new());
        settle(&calls).await;

        assert!(matches!(
            calls.last_error.lock().as_ref(),
            Some(Error::Unavailable)
        ));
    }
}
