use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use tracing::{trace, Instrument, Span};

use super::{Checkout, Grant, Pool, PoolInner, PoolableSession, Start};
use crate::conn::Connect;
use crate::session::CloseMode;
use crate::{BoxFuture, Cancellable, Error, Target, VersionPolicy};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

/// Cancels a pending [`Lease`].
///
/// A cancelled lease resolves to [`Error::Cancelled`] and gives back
/// anything the pool had already granted it.
#[derive(Debug, Clone)]
pub struct LeaseCanceller(Arc<CancelState>);

impl Cancellable for LeaseCanceller {
    fn cancel(&self) -> bool {
        if self.0.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.0.waker.wake();
        true
    }
}

enum State<S> {
    Ready(Result<Checkout<S>, Error>),
    Waiting(oneshot::Receiver<Grant<S>>),
    Connecting(BoxFuture<'static, Result<S, Error>>),
    Done,
}

impl<S> fmt::Debug for State<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Ready(Ok(_)) => f.write_str("Ready"),
            State::Ready(Err(error)) => f.debug_tuple("Failed").field(error).finish(),
            State::Waiting(_) => f.write_str("Waiting"),
            State::Connecting(_) => f.write_str("Connecting"),
            State::Done => f.write_str("Done"),
        }
    }
}

/// A future resolving to a [`Leased`] session.
///
/// Dropping the lease before it resolves gives up its place in line. A
/// connection it had started is finished in the background and added to
/// the pool.
#[must_use = "leases do nothing unless polled"]
pub struct Lease<C: Connect> {
    pool: Pool<C>,
    target: Target,
    policy: VersionPolicy,
    state: State<C::Session>,
    deadline: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
    cancel: Arc<CancelState>,
    span: Span,
}

// Nothing in a lease is structurally pinned.
impl<C: Connect> Unpin for Lease<C> {}

impl<C: Connect> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("target", &self.target)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish()
    }
}

impl<C: Connect> Lease<C> {
    pub(super) fn new(
        pool: Pool<C>,
        target: Target,
        policy: VersionPolicy,
        start: Start<C::Session>,
        timeout: Option<Duration>,
        span: Span,
    ) -> Self {
        let state = match start {
            Start::Ready(result) => State::Ready(result),
            Start::Wait(rx) => State::Waiting(rx),
            Start::Connect => State::Connecting(pool.connect(target.clone(), policy)),
        };

        Self {
            pool,
            target,
            policy,
            state,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            sleep: None,
            cancel: Arc::new(CancelState::default()),
            span,
        }
    }

    /// A handle which cancels this lease.
    pub fn canceller(&self) -> LeaseCanceller {
        LeaseCanceller(self.cancel.clone())
    }

    /// The target this lease is for.
    pub fn target(&self) -> &Target {
        &self.target
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.cancelled.load(Ordering::Acquire)
    }

    /// Give back whatever the pool granted so far.
    fn abandon(&mut self) {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Ready(Ok(checkout)) => {
                trace!("returning unclaimed session");
                self.pool
                    .return_grant(&self.target, Grant::Session(checkout), self.policy);
            }
            State::Waiting(mut rx) => {
                rx.close();
                if let Ok(grant) = rx.try_recv() {
                    self.pool.return_grant(&self.target, grant, self.policy);
                }
            }
            State::Connecting(connecting) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    trace!("finishing connect in the background");
                    let pool = self.pool.clone();
                    let target = self.target.clone();
                    let policy = self.policy;
                    handle.spawn(
                        async move {
                            let result = connecting.await;
                            if let Err(error) = pool.connected(&target, policy, result, false) {
                                trace!(%error, "background connect failed");
                            }
                        }
                        .instrument(self.span.clone()),
                    );
                }
                Err(_) => self.pool.cancel_connect(&self.target, self.policy),
            },
            State::Ready(Err(_)) | State::Done => {}
        }
    }

    fn poll_state(&mut self, cx: &mut Context<'_>) -> Poll<Result<Checkout<C::Session>, Error>> {
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Ready(result) => return Poll::Ready(result),
                State::Waiting(mut rx) => match Pin::new(&mut rx).poll(cx) {
                    Poll::Ready(Ok(Grant::Session(checkout))) => {
                        self.state = State::Ready(Ok(checkout));
                    }
                    Poll::Ready(Ok(Grant::Connect)) => {
                        trace!("capacity granted, connecting");
                        self.state = State::Connecting(self.pool.connect(self.target.clone(), self.policy));
                    }
                    Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::Unavailable)),
                    Poll::Pending => {
                        self.state = State::Waiting(rx);
                        return Poll::Pending;
                    }
                },
                State::Connecting(mut connecting) => match connecting.as_mut().poll(cx) {
                    Poll::Ready(result) => {
                        let checkout = self.pool.connected(&self.target, self.policy, result, true)?;
                        self.state = State::Ready(checkout.ok_or(Error::Unavailable));
                    }
                    Poll::Pending => {
                        self.state = State::Connecting(connecting);
                        return Poll::Pending;
                    }
                },
                State::Done => return Poll::Ready(Err(Error::Unavailable)),
            }
        }
    }
}

impl<C: Connect> Future for Lease<C> {
    type Output = Result<Leased<C::Session>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let span = this.span.clone();
        let _entered = span.enter();

        this.cancel.waker.register(cx.waker());
        if this.is_cancelled() {
            trace!("lease cancelled");
            this.abandon();
            return Poll::Ready(Err(Error::Cancelled));
        }

        if let Poll::Ready(result) = this.poll_state(cx) {
            return Poll::Ready(result.map(|checkout| this.pool.leased(this.target.clone(), checkout)));
        }

        if let Some(deadline) = this.deadline {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            if sleep.as_mut().poll(cx).is_ready() {
                trace!("lease timed out");
                this.abandon();
                return Poll::Ready(Err(Error::Timeout));
            }
        }

        Poll::Pending
    }
}

impl<C: Connect> Drop for Lease<C> {
    fn drop(&mut self) {
        let span = self.span.clone();
        let _entered = span.enter();
        self.abandon();
    }
}

/// A session leased from the pool.
///
/// The session goes back to the pool when released or dropped. Dropping
/// returns it as reusable as long as it is still open.
pub struct Leased<S: PoolableSession> {
    session: S,
    shared: bool,
    created: Instant,
    target: Target,
    pool: Weak<Mutex<PoolInner<S>>>,
    released: bool,
}

impl<S: PoolableSession> fmt::Debug for Leased<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leased")
            .field("session", &self.session)
            .field("target", &self.target)
            .field("shared", &self.shared)
            .finish()
    }
}

impl<S: PoolableSession> Leased<S> {
    pub(super) fn new(pool: Weak<Mutex<PoolInner<S>>>, target: Target, checkout: Checkout<S>) -> Self {
        Self {
            session: checkout.session,
            shared: checkout.shared,
            created: checkout.created,
            target,
            pool,
            released: false,
        }
    }

    /// The leased session.
    pub fn session(&self) -> &S {
        &self.session
    }

    /// The target the session is connected to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Is the session shared with other leases?
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Return the session to the pool. Sessions which are not `reusable`
    /// are closed.
    pub fn release(mut self, reusable: bool) {
        self.give_back(reusable);
    }

    fn give_back(&mut self, reusable: bool) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        let checkout = Checkout {
            session: self.session.clone(),
            shared: self.shared,
            created: self.created,
        };
        match self.pool.upgrade() {
            Some(pool) => pool.lock().release(&self.target, checkout, reusable),
            None => checkout.session.close(CloseMode::Graceful),
        }
    }
}

impl<S: PoolableSession> Deref for Leased<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: PoolableSession> Drop for Leased<S> {
    fn drop(&mut self) {
        let reusable = self.session.is_open();
        self.give_back(reusable);
    }
}
