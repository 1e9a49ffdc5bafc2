//! Connection pooling.
//!
//! The [`Pool`] leases sessions by [`Target`]. Exclusive sessions (HTTP/1.1)
//! are handed to one borrower at a time and return to the idle set when
//! released. Shared sessions (HTTP/2) stay in the pool while leased, and every
//! lease for the route receives a handle to the same connection.
//!
//! Each route has a cap on the number of physical sessions, and the pool has
//! a total cap. Leases beyond capacity wait in FIFO order; under
//! [`ConcurrencyPolicy::Strict`] the total cap is enforced as well, evicting
//! the least recently used idle session of another route to make room.
//!
//! The pool never hands out a closed session: sessions are checked when they
//! leave the idle set, and closed, expired or (after a period of inactivity)
//! invalid sessions are evicted on the way.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::conn::{Connect, ConnectRequest};
use crate::session::{CloseMode, Session};
use crate::{BoxFuture, Error, Target, VersionPolicy};

mod idle;
mod lease;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;

use self::idle::{usable, Age, IdleSessions};
pub use self::lease::{Lease, LeaseCanceller, Leased};

/// A session the pool can manage.
pub trait PoolableSession: Session + Clone + fmt::Debug + 'static {
    /// Can the session be leased to several borrowers at once?
    fn can_share(&self) -> bool {
        self.protocol().multiplex()
    }

    /// Probe a session which has been idle for longer than the pool's
    /// validation threshold. The default only checks that it is still open.
    fn validate(&self) -> bool {
        self.is_open()
    }
}

/// How the total cap is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// The total cap is a hard limit. New connections evict idle sessions of
    /// other routes, or wait.
    #[default]
    Strict,

    /// Only the per-route caps are enforced.
    Lax,
}

/// Which idle session is reused first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusePolicy {
    /// The most recently released.
    #[default]
    Lifo,

    /// The least recently released.
    Fifo,
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of sessions per route.
    pub max_per_route: usize,

    /// Maximum number of sessions across all routes.
    pub max_total: usize,

    /// Sessions older than this are not reused.
    pub time_to_live: Option<Duration>,

    /// Idle sessions older than this are closed.
    pub idle_timeout: Option<Duration>,

    /// Sessions idle for longer than this are validated before reuse.
    pub validate_after_inactivity: Option<Duration>,

    /// Enforcement of the total cap.
    pub concurrency_policy: ConcurrencyPolicy,

    /// Order in which idle sessions are reused.
    pub reuse_policy: ReusePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_per_route: 5,
            max_total: 25,
            time_to_live: None,
            idle_timeout: Some(Duration::from_secs(90)),
            validate_after_inactivity: Some(Duration::from_secs(2)),
            concurrency_policy: ConcurrencyPolicy::default(),
            reuse_policy: ReusePolicy::default(),
        }
    }
}

impl Config {
    /// Set the per-route cap.
    pub fn with_max_per_route(mut self, max: usize) -> Self {
        self.max_per_route = max;
        self
    }

    /// Set the total cap.
    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = max;
        self
    }

    /// Set the session time to live.
    pub fn with_time_to_live(mut self, ttl: Option<Duration>) -> Self {
        self.time_to_live = ttl;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the inactivity threshold for validation.
    pub fn with_validate_after_inactivity(mut self, after: Option<Duration>) -> Self {
        self.validate_after_inactivity = after;
        self
    }

    /// Set the concurrency policy.
    pub fn with_concurrency_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency_policy = policy;
        self
    }

    /// Set the reuse policy.
    pub fn with_reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }
}

/// Occupancy of a route, or of the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Sessions currently leased.
    pub leased: usize,

    /// Idle sessions ready to be leased.
    pub available: usize,

    /// Leases waiting for capacity.
    pub pending: usize,

    /// The cap in effect.
    pub max: usize,
}

/// A session leaving the pool.
#[derive(Debug)]
pub(crate) struct Checkout<S> {
    pub(crate) session: S,
    pub(crate) shared: bool,
    pub(crate) created: Instant,
}

/// What a waiting lease is given once capacity frees up.
#[derive(Debug)]
pub(crate) enum Grant<S> {
    /// A session to use.
    Session(Checkout<S>),

    /// A reserved slot to open a new connection in.
    Connect,
}

#[derive(Debug)]
struct Waiter<S> {
    id: u64,
    hint: bool,
    tx: oneshot::Sender<Grant<S>>,
}

#[derive(Debug)]
struct SharedEntry<S> {
    session: S,
    age: Age,
    borrowers: usize,
}

#[derive(Debug)]
struct Route<S> {
    max: usize,
    leased: usize,
    connecting: usize,
    connecting_shared: usize,
    idle: IdleSessions<S>,
    shared: Vec<SharedEntry<S>>,
    waiters: VecDeque<Waiter<S>>,
}

impl<S: PoolableSession> Route<S> {
    fn new(max: usize) -> Self {
        Self {
            max,
            leased: 0,
            connecting: 0,
            connecting_shared: 0,
            idle: IdleSessions::default(),
            shared: Vec::new(),
            waiters: VecDeque::new(),
        }
    }

    /// Physical sessions held against the route's cap.
    fn allocated(&self) -> usize {
        self.leased + self.connecting + self.idle.len() + self.shared.len()
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.tx.is_closed());
    }

    /// Take a usable session: a shared one if any, an idle exclusive one
    /// otherwise.
    fn checkout(&mut self, config: &Config, now: Instant) -> Option<Checkout<S>> {
        self.shared.retain(|entry| {
            let keep = if entry.borrowers == 0 {
                usable(&entry.session, &entry.age, config, now)
            } else {
                entry.session.is_open() && !entry.age.outlived(config, now)
            };
            if !keep {
                trace!(session = %entry.session.id(), "evicting shared session");
                entry.session.close(CloseMode::Graceful);
            }
            keep
        });

        if let Some(entry) = self.shared.iter_mut().min_by_key(|entry| entry.borrowers) {
            entry.borrowers += 1;
            return Some(Checkout {
                session: entry.session.clone(),
                shared: true,
                created: entry.age.created,
            });
        }

        let (entry, discarded) = self.idle.pop(config, now);
        if discarded > 0 {
            debug!(discarded, "evicted unusable idle sessions");
        }
        entry.map(|entry| {
            self.leased += 1;
            Checkout {
                session: entry.session,
                shared: false,
                created: entry.age.created,
            }
        })
    }

    /// Undo a checkout which never reached a borrower.
    fn undo(&mut self, checkout: Checkout<S>, now: Instant) {
        if checkout.shared {
            if let Some(entry) = self.entry(&checkout.session) {
                entry.borrowers = entry.borrowers.saturating_sub(1);
            }
        } else {
            self.leased = self.leased.saturating_sub(1);
            self.idle.push(checkout.session, checkout.created, now);
        }
    }

    fn entry(&mut self, session: &S) -> Option<&mut SharedEntry<S>> {
        let id = session.id();
        self.shared.iter_mut().find(|entry| entry.session.id() == id)
    }

    fn stats(&self) -> PoolStats {
        let busy = self.shared.iter().filter(|entry| entry.borrowers > 0).count();
        PoolStats {
            leased: self.leased + busy,
            available: self.idle.len() + self.shared.len() - busy,
            pending: self.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            max: self.max,
        }
    }

    fn close(&mut self, mode: CloseMode) {
        self.idle.clear();
        for entry in self.shared.drain(..) {
            entry.session.close(mode);
        }
        self.waiters.clear();
    }
}

#[derive(Debug)]
pub(crate) struct PoolInner<S> {
    config: Config,
    routes: HashMap<Target, Route<S>>,
    closed: bool,
    next_waiter: u64,
}

impl<S: PoolableSession> PoolInner<S> {
    fn new(config: Config) -> Self {
        Self {
            config,
            routes: HashMap::new(),
            closed: false,
            next_waiter: 0,
        }
    }

    fn route(&mut self, target: &Target) -> &mut Route<S> {
        let max = self.config.max_per_route;
        self.routes
            .entry(target.clone())
            .or_insert_with(|| Route::new(max))
    }

    fn total(&self) -> usize {
        self.routes.values().map(Route::allocated).sum()
    }

    /// Reserve a slot for a new connection to `target`.
    fn reserve(&mut self, target: &Target) -> bool {
        let route = self.route(target);
        if route.allocated() >= route.max {
            trace!(%target, "route at capacity");
            return false;
        }

        if self.config.concurrency_policy == ConcurrencyPolicy::Strict
            && self.total() >= self.config.max_total
            && !self.evict_lru()
        {
            trace!("pool at capacity");
            return false;
        }

        self.route(target).connecting += 1;
        true
    }

    /// Close the least recently used idle session of any route.
    fn evict_lru(&mut self) -> bool {
        enum Victim {
            Idle,
            Shared(usize),
        }

        let mut oldest: Option<(Instant, Target, Victim)> = None;
        for (target, route) in &self.routes {
            if let Some(since) = route.idle.oldest() {
                if oldest.as_ref().map_or(true, |(at, _, _)| since < *at) {
                    oldest = Some((since, target.clone(), Victim::Idle));
                }
            }
            for (index, entry) in route.shared.iter().enumerate() {
                if entry.borrowers == 0
                    && oldest.as_ref().map_or(true, |(at, _, _)| entry.age.since < *at)
                {
                    oldest = Some((entry.age.since, target.clone(), Victim::Shared(index)));
                }
            }
        }

        let Some((_, target, victim)) = oldest else {
            return false;
        };
        debug!(%target, "evicting least recently used session");
        let Some(route) = self.routes.get_mut(&target) else {
            return false;
        };
        match victim {
            Victim::Idle => route.idle.evict_oldest(),
            Victim::Shared(index) => {
                let entry = route.shared.remove(index);
                entry.session.close(CloseMode::Graceful);
                true
            }
        }
    }

    fn wait(&mut self, target: &Target, hint: bool) -> oneshot::Receiver<Grant<S>> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.route(target).waiters.push_back(Waiter { id, hint, tx });
        trace!(%target, waiter = id, "lease waiting for capacity");
        rx
    }

    /// Hand freed capacity to waiting leases, oldest first.
    fn dispatch(&mut self) {
        if self.closed {
            return;
        }

        let mut order: Vec<(u64, Target)> = self
            .routes
            .iter_mut()
            .filter_map(|(target, route)| {
                route.prune_waiters();
                route.waiters.front().map(|w| (w.id, target.clone()))
            })
            .collect();
        order.sort_by_key(|(id, _)| *id);

        let now = Instant::now();
        for (_, target) in order {
            self.dispatch_route(&target, now);
        }
    }

    fn dispatch_route(&mut self, target: &Target, now: Instant) {
        loop {
            let PoolInner { config, routes, .. } = &mut *self;
            let Some(route) = routes.get_mut(target) else {
                return;
            };
            route.prune_waiters();
            if route.waiters.is_empty() {
                return;
            }

            if let Some(checkout) = route.checkout(config, now) {
                let Some(waiter) = route.waiters.pop_front() else {
                    route.undo(checkout, now);
                    return;
                };
                trace!(%target, waiter = waiter.id, "handing session to waiter");
                if let Err(Grant::Session(checkout)) = waiter.tx.send(Grant::Session(checkout)) {
                    route.undo(checkout, now);
                }
                continue;
            }

            if route.connecting_shared > 0 || !self.reserve(target) {
                return;
            }

            let route = self.route(target);
            let Some(waiter) = route.waiters.pop_front() else {
                route.connecting -= 1;
                return;
            };
            trace!(%target, waiter = waiter.id, "waiter may connect");
            if waiter.hint {
                route.connecting_shared += 1;
            }
            if waiter.tx.send(Grant::Connect).is_err() {
                route.connecting -= 1;
                if waiter.hint {
                    route.connecting_shared -= 1;
                }
            }
        }
    }

    /// Forget routes with nothing in them.
    fn tidy(&mut self, target: &Target) {
        let max = self.config.max_per_route;
        if let Some(route) = self.routes.get(target) {
            if route.allocated() == 0 && route.waiters.is_empty() && route.max == max {
                self.routes.remove(target);
            }
        }
    }

    fn release(&mut self, target: &Target, checkout: Checkout<S>, reusable: bool) {
        let now = Instant::now();
        let closed = self.closed;
        let PoolInner { config, routes, .. } = &mut *self;
        let Some(route) = routes.get_mut(target) else {
            checkout.session.close(CloseMode::Graceful);
            return;
        };

        let session = checkout.session;
        if checkout.shared {
            let id = session.id();
            if let Some(index) = route.shared.iter().position(|e| e.session.id() == id) {
                let entry = &mut route.shared[index];
                entry.borrowers = entry.borrowers.saturating_sub(1);
                if entry.borrowers == 0 {
                    entry.age.since = now;
                }

                let keep = reusable
                    && !closed
                    && entry.session.is_open()
                    && !entry.age.outlived(config, now);
                if !keep {
                    trace!(session = %id, "shared session removed from pool");
                    route.shared.remove(index).session.close(CloseMode::Graceful);
                }
            }
        } else {
            route.leased = route.leased.saturating_sub(1);
            let age = Age {
                created: checkout.created,
                since: now,
            };
            if reusable && !closed && session.is_open() && !age.outlived(config, now) {
                trace!(session = %session.id(), "session returned to pool");
                route.idle.push(session, checkout.created, now);
            } else {
                trace!(session = %session.id(), "session not reusable, closing");
                session.close(CloseMode::Immediate);
            }
        }

        self.dispatch();
        self.tidy(target);
    }

    /// Record the outcome of a connect. Returns the checkout when the
    /// session is for the lease which connected it.
    fn connected(
        &mut self,
        target: &Target,
        hint: bool,
        result: Result<S, Error>,
        for_lease: bool,
    ) -> Result<Option<Checkout<S>>, Error> {
        let closed = self.closed;
        let route = self.route(target);
        route.connecting = route.connecting.saturating_sub(1);
        if hint {
            route.connecting_shared = route.connecting_shared.saturating_sub(1);
        }

        let outcome = match result {
            Ok(session) if closed => {
                session.close(CloseMode::Immediate);
                Err(Error::Unavailable)
            }
            Ok(session) => {
                let now = Instant::now();
                if session.can_share() {
                    trace!(session = %session.id(), "new shared session");
                    route.shared.push(SharedEntry {
                        session: session.clone(),
                        age: Age::new(now),
                        borrowers: usize::from(for_lease),
                    });
                    Ok(for_lease.then_some(Checkout {
                        session,
                        shared: true,
                        created: now,
                    }))
                } else if for_lease {
                    route.leased += 1;
                    Ok(Some(Checkout {
                        session,
                        shared: false,
                        created: now,
                    }))
                } else {
                    route.idle.push(session, now, now);
                    Ok(None)
                }
            }
            Err(error) => {
                debug!(%target, %error, "connect failed");
                Err(error)
            }
        };

        self.dispatch();
        self.tidy(target);
        outcome
    }

    /// Give back what an abandoned lease was granted.
    fn return_grant(&mut self, target: &Target, grant: Grant<S>, hint: bool) {
        match grant {
            Grant::Session(checkout) => {
                let reusable = checkout.session.is_open();
                self.release(target, checkout, reusable);
            }
            Grant::Connect => self.cancel_connect(target, hint),
        }
    }

    fn cancel_connect(&mut self, target: &Target, hint: bool) {
        let route = self.route(target);
        route.connecting = route.connecting.saturating_sub(1);
        if hint {
            route.connecting_shared = route.connecting_shared.saturating_sub(1);
        }
        self.dispatch();
        self.tidy(target);
    }
}

/// How a lease starts out.
pub(crate) enum Start<S> {
    Ready(Result<Checkout<S>, Error>),
    Wait(oneshot::Receiver<Grant<S>>),
    Connect,
}

/// A pool of sessions, keyed by [`Target`].
pub struct Pool<C: Connect> {
    inner: Arc<Mutex<PoolInner<C::Session>>>,
    connector: C,
}

impl<C: Connect> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            connector: self.connector.clone(),
        }
    }
}

impl<C: Connect> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pool")
            .field("routes", &inner.routes.len())
            .field("closed", &inner.closed)
            .field("config", &inner.config)
            .finish()
    }
}

impl<C: Connect> Pool<C> {
    /// Create a pool which opens sessions with `connector`.
    pub fn new(connector: C, config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::new(config))),
            connector,
        }
    }

    /// Lease a session for `target`.
    ///
    /// The lease resolves to an idle or shared session if one is usable,
    /// otherwise to a new connection once capacity allows. With a `timeout`,
    /// a lease still waiting when it elapses fails with [`Error::Timeout`].
    pub fn lease(&self, target: Target, policy: VersionPolicy, timeout: Option<Duration>) -> Lease<C> {
        let span = tracing::debug_span!("lease", %target);
        let start = {
            let _entered = span.enter();
            self.start(&target, policy)
        };
        Lease::new(self.clone(), target, policy, start, timeout, span)
    }

    fn start(&self, target: &Target, policy: VersionPolicy) -> Start<C::Session> {
        let hint = multiplex_hint(policy);
        let mut inner = self.inner.lock();
        if inner.closed {
            return Start::Ready(Err(Error::Unavailable));
        }

        let now = Instant::now();
        let PoolInner { config, routes, .. } = &mut *inner;
        let max = config.max_per_route;
        let route = routes.entry(target.clone()).or_insert_with(|| Route::new(max));
        route.prune_waiters();

        if route.waiters.is_empty() {
            if let Some(checkout) = route.checkout(config, now) {
                trace!(session = %checkout.session.id(), shared = checkout.shared, "session found in pool");
                return Start::Ready(Ok(checkout));
            }
        }

        if !route.waiters.is_empty() || route.connecting_shared > 0 {
            return Start::Wait(inner.wait(target, hint));
        }

        if inner.reserve(target) {
            if hint {
                inner.route(target).connecting_shared += 1;
            }
            trace!("connecting to target");
            Start::Connect
        } else {
            Start::Wait(inner.wait(target, hint))
        }
    }

    pub(crate) fn connect(&self, target: Target, policy: VersionPolicy) -> BoxFuture<'static, Result<C::Session, Error>> {
        Box::pin(self.connector.connect(ConnectRequest::new(target, policy)))
    }

    pub(crate) fn connected(
        &self,
        target: &Target,
        policy: VersionPolicy,
        result: Result<C::Session, Error>,
        for_lease: bool,
    ) -> Result<Option<Checkout<C::Session>>, Error> {
        self.inner
            .lock()
            .connected(target, multiplex_hint(policy), result, for_lease)
    }

    pub(crate) fn return_grant(&self, target: &Target, grant: Grant<C::Session>, policy: VersionPolicy) {
        self.inner
            .lock()
            .return_grant(target, grant, multiplex_hint(policy));
    }

    pub(crate) fn cancel_connect(&self, target: &Target, policy: VersionPolicy) {
        self.inner.lock().cancel_connect(target, multiplex_hint(policy));
    }

    pub(crate) fn leased(&self, target: Target, checkout: Checkout<C::Session>) -> Leased<C::Session> {
        Leased::new(Arc::downgrade(&self.inner), target, checkout)
    }

    /// Close idle sessions which have not been used for `idle`.
    pub fn close_idle(&self, idle: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut closed = 0;
        for route in inner.routes.values_mut() {
            closed += route.idle.close_idle(idle, now);
            route.shared.retain(|entry| {
                let stale = entry.borrowers == 0 && now.saturating_duration_since(entry.age.since) >= idle;
                if stale {
                    entry.session.close(CloseMode::Graceful);
                    closed += 1;
                }
                !stale
            });
        }
        debug!(closed, "closed idle sessions");
        inner.dispatch();
    }

    /// Close idle sessions past their time to live or idle timeout.
    pub fn close_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let PoolInner { config, routes, .. } = &mut *inner;
        let mut closed = 0;
        for route in routes.values_mut() {
            closed += route.idle.close_where(|entry| entry.age.is_expired(config, now));
            route.shared.retain(|entry| {
                let expired = entry.age.outlived(config, now)
                    || (entry.borrowers == 0 && entry.age.is_expired(config, now));
                if expired {
                    entry.session.close(CloseMode::Graceful);
                    closed += 1;
                }
                !expired
            });
        }
        debug!(closed, "closed expired sessions");
        inner.dispatch();
    }

    /// Validate sessions idle for longer than `after` before reuse.
    pub fn set_validate_after_inactivity(&self, after: Option<Duration>) {
        self.inner.lock().config.validate_after_inactivity = after;
    }

    /// Override the cap for one route.
    pub fn set_max_per_route(&self, target: &Target, max: usize) {
        let mut inner = self.inner.lock();
        inner.route(target).max = max;
        inner.dispatch();
    }

    /// The cap in effect for `target`.
    pub fn max_per_route(&self, target: &Target) -> usize {
        let inner = self.inner.lock();
        inner
            .routes
            .get(target)
            .map_or(inner.config.max_per_route, |route| route.max)
    }

    /// Routes with sessions or waiting leases.
    pub fn routes(&self) -> Vec<Target> {
        let inner = self.inner.lock();
        inner
            .routes
            .iter()
            .filter(|(_, route)| route.allocated() > 0 || !route.waiters.is_empty())
            .map(|(target, _)| target.clone())
            .collect()
    }

    /// Occupancy of one route.
    pub fn stats(&self, target: &Target) -> PoolStats {
        let inner = self.inner.lock();
        inner.routes.get(target).map_or(
            PoolStats {
                max: inner.config.max_per_route,
                ..PoolStats::default()
            },
            Route::stats,
        )
    }

    /// Occupancy of the whole pool.
    pub fn total_stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut total = inner
            .routes
            .values()
            .map(Route::stats)
            .fold(PoolStats::default(), |total, stats| PoolStats {
                leased: total.leased + stats.leased,
                available: total.available + stats.available,
                pending: total.pending + stats.pending,
                max: 0,
            });
        total.max = inner.config.max_total;
        total
    }

    /// Close the pool: idle sessions are closed, waiting leases fail with
    /// [`Error::Unavailable`], and leased sessions are closed on release.
    pub fn close(&self) {
        self.shutdown(CloseMode::Graceful);
    }

    /// Close the pool, closing shared sessions with `mode`. Exclusive
    /// sessions on lease are closed when they are released.
    pub fn shutdown(&self, mode: CloseMode) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        debug!(?mode, "closing pool");
        inner.closed = true;
        for route in inner.routes.values_mut() {
            route.close(mode);
        }
    }

    /// Has the pool been closed?
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Leases under a policy which always yields HTTP/2 wait for an in-flight
/// connect to the route instead of dialling again.
fn multiplex_hint(policy: VersionPolicy) -> bool {
    policy == VersionPolicy::ForceHttp2
}

#[cfg(test)]
mod tests {
    use super::mock::{MockConnector, MockSession};
    use super::*;

    static_assertions::assert_impl_all!(Pool<MockConnector>: Clone, Send, Sync);
    static_assertions::assert_impl_all!(Leased<MockSession>: Send, Sync);

    fn target(host: &str) -> Target {
        format!("http://{host}").parse().unwrap()
    }

    fn config() -> Config {
        Config::default().with_max_per_route(2).with_max_total(3)
    }

    async fn lease(pool: &Pool<MockConnector>, host: &str) -> Leased<MockSession> {
        pool.lease(target(host), VersionPolicy::Negotiate, None)
            .await
            .unwrap()
    }

    #[test]
    fn sensible_config() {
        let config = Config::default();
        assert!(config.max_per_route > 0);
        assert!(config.max_total >= config.max_per_route);
        assert_eq!(config.concurrency_policy, ConcurrencyPolicy::Strict);
        assert_eq!(config.reuse_policy, ReusePolicy::Lifo);
    }

    #[tokio::test]
    async fn exclusive_sessions_are_reused() {
        let _ = tracing_subscriber::fmt::try_init();
        let connector = MockConnector::exclusive();
        let pool = Pool::new(connector.clone(), config());

        let first = lease(&pool, "a.example").await;
        let id = first.session().id();
        assert!(!first.is_shared());
        assert_eq!(pool.stats(&target("a.example")).leased, 1);
        first.release(true);

        let stats = pool.stats(&target("a.example"));
        assert_eq!((stats.leased, stats.available), (0, 1));

        let second = lease(&pool, "a.example").await;
        assert_eq!(second.session().id(), id);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn unreusable_release_closes() {
        let connector = MockConnector::exclusive();
        let pool = Pool::new(connector.clone(), config());

        let leased = lease(&pool, "a.example").await;
        let session = leased.session().clone();
        leased.release(false);
        assert!(!session.is_open());
        assert_eq!(pool.stats(&target("a.example")).available, 0);
        assert!(pool.routes().is_empty());
    }

    #[tokio::test]
    async fn dropped_lease_returns_open_session() {
        let pool = Pool::new(MockConnector::exclusive(), config());
        drop(lease(&pool, "a.example").await);
        assert_eq!(pool.stats(&target("a.example")).available, 1);
    }

    #[tokio::test]
    async fn closed_session_is_never_handed_out() {
        let connector = MockConnector::exclusive();
        let pool = Pool::new(connector.clone(), config());

        let leased = lease(&pool, "a.example").await;
        let session = leased.session().clone();
        leased.release(true);
        session.close(CloseMode::Immediate);

        let next = lease(&pool, "a.example").await;
        assert_ne!(next.session().id(), session.id());
        assert!(next.is_open());
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_after_inactivity() {
        let connector = MockConnector::exclusive();
        let pool = Pool::new(
            connector.clone(),
            config().with_validate_after_inactivity(Some(Duration::from_secs(1))),
        );

        let leased = lease(&pool, "a.example").await;
        let session = leased.session().clone();
        leased.release(true);
        session.set_valid(false);

        let again = lease(&pool, "a.example").await;
        assert_eq!(again.session().id(), session.id());
        again.release(true);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = lease(&pool, "a.example").await;
        assert_ne!(fresh.session().id(), session.id());
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn shared_sessions_are_leased_concurrently() {
        let connector = MockConnector::shared();
        let pool = Pool::new(connector.clone(), config());

        let first = lease(&pool, "a.example").await;
        let second = lease(&pool, "a.example").await;
        assert!(first.is_shared());
        assert_eq!(first.session().id(), second.session().id());
        assert_eq!(connector.connects(), 1);

        let stats = pool.stats(&target("a.example"));
        assert_eq!((stats.leased, stats.available), (1, 0));
        drop(first);
        drop(second);
        assert_eq!(pool.stats(&target("a.example")).available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leases_wait_for_multiplexed_connect() {
        let connector = MockConnector::shared().with_delay(Duration::from_millis(50));
        let pool = Pool::new(connector.clone(), config());
        let target = target("a.example");

        let a = pool.lease(target.clone(), VersionPolicy::ForceHttp2, None);
        let b = pool.lease(target.clone(), VersionPolicy::ForceHttp2, None);
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap().session().id(), b.unwrap().session().id());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let pool = Pool::new(MockConnector::exclusive(), config().with_max_per_route(1));
        let target = target("a.example");

        let held = lease(&pool, "a.example").await;
        let mut first = pending_lease(&pool, &target);
        let mut second = pending_lease(&pool, &target);
        assert_eq!(pool.stats(&target).pending, 2);

        let id = held.session().id();
        held.release(true);

        let first = (&mut first).await.unwrap();
        assert_eq!(first.session().id(), id);
        assert_eq!(pool.stats(&target).pending, 1);

        first.release(true);
        let second = (&mut second).await.unwrap();
        assert_eq!(second.session().id(), id);
    }

    fn pending_lease(pool: &Pool<MockConnector>, target: &Target) -> std::pin::Pin<Box<Lease<MockConnector>>> {
        let mut lease = Box::pin(pool.lease(target.clone(), VersionPolicy::Negotiate, None));
        let waker = futures_util::task::noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        assert!(std::future::Future::poll(lease.as_mut(), &mut cx).is_pending());
        lease
    }

    #[tokio::test(start_paused = true)]
    async fn lease_times_out_at_capacity() {
        let pool = Pool::new(MockConnector::exclusive(), config().with_max_per_route(1));
        let _held = lease(&pool, "a.example").await;

        let error = pool
            .lease(target("a.example"), VersionPolicy::Negotiate, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(error.is_timeout());
        assert_eq!(pool.stats(&target("a.example")).pending, 0);
    }

    #[tokio::test]
    async fn connect_failure_frees_capacity() {
        let connector = MockConnector::exclusive();
        let pool = Pool::new(connector.clone(), config().with_max_per_route(1));

        connector.set_fail(true);
        let error = pool
            .lease(target("a.example"), VersionPolicy::Negotiate, None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Connect(_)));

        connector.set_fail(false);
        let leased = lease(&pool, "a.example").await;
        assert!(leased.is_open());
    }

    #[tokio::test]
    async fn strict_total_evicts_idle_of_other_route() {
        let pool = Pool::new(MockConnector::exclusive(), config().with_max_total(2));

        let a = lease(&pool, "a.example").await;
        let b = lease(&pool, "b.example").await;
        let idle = b.session().clone();
        b.release(true);

        let c = lease(&pool, "c.example").await;
        assert!(c.is_open());
        assert!(!idle.is_open());
        assert_eq!(pool.total_stats().leased, 2);
        drop(a);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_total_waits_when_nothing_is_idle() {
        let pool = Pool::new(MockConnector::exclusive(), config().with_max_total(1));
        let held = lease(&pool, "a.example").await;

        let error = pool
            .lease(target("b.example"), VersionPolicy::Negotiate, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(error.is_timeout());

        let waiting = pool.lease(target("b.example"), VersionPolicy::Negotiate, None);
        held.release(false);
        assert!(waiting.await.unwrap().is_open());
    }

    #[tokio::test]
    async fn lax_ignores_total() {
        let pool = Pool::new(
            MockConnector::exclusive(),
            config()
                .with_max_total(1)
                .with_concurrency_policy(ConcurrencyPolicy::Lax),
        );
        let _a = lease(&pool, "a.example").await;
        let _b = lease(&pool, "b.example").await;
        assert_eq!(pool.total_stats().leased, 2);
    }

    #[tokio::test]
    async fn cancelled_lease() {
        let pool = Pool::new(MockConnector::exclusive(), config().with_max_per_route(1));
        let _held = lease(&pool, "a.example").await;

        let lease = pool.lease(target("a.example"), VersionPolicy::Negotiate, None);
        let canceller = lease.canceller();
        assert!(crate::Cancellable::cancel(&canceller));
        assert!(lease.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_connect_completes_in_background() {
        let connector = MockConnector::exclusive().with_delay(Duration::from_millis(100));
        let pool = Pool::new(connector.clone(), config());

        let error = pool
            .lease(target("a.example"), VersionPolicy::Negotiate, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(error.is_timeout());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.stats(&target("a.example")).available, 1);
        let leased = lease(&pool, "a.example").await;
        assert!(leased.is_open());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn close_idle_sessions() {
        let pool = Pool::new(MockConnector::exclusive(), config());
        let leased = lease(&pool, "a.example").await;
        let session = leased.session().clone();
        leased.release(true);

        pool.close_idle(Duration::ZERO);
        assert!(!session.is_open());
        assert_eq!(pool.stats(&target("a.example")).available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_expired_sessions() {
        let pool = Pool::new(
            MockConnector::exclusive(),
            config().with_time_to_live(Some(Duration::from_secs(10))),
        );
        let leased = lease(&pool, "a.example").await;
        let session = leased.session().clone();
        leased.release(true);

        pool.close_expired();
        assert!(session.is_open());
        tokio::time::advance(Duration::from_secs(11)).await;
        pool.close_expired();
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn closed_pool() {
        let pool = Pool::new(MockConnector::exclusive(), config().with_max_per_route(1));
        let held = lease(&pool, "a.example").await;
        let waiting = pending_lease(&pool, &target("a.example"));

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(waiting.await, Err(Error::Unavailable)));

        let session = held.session().clone();
        held.release(true);
        assert!(!session.is_open());

        let error = pool
            .lease(target("a.example"), VersionPolicy::Negotiate, None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Unavailable));
    }

    #[tokio::test]
    async fn route_caps() {
        let pool = Pool::new(MockConnector::exclusive(), config());
        let target = target("a.example");
        assert_eq!(pool.max_per_route(&target), 2);
        pool.set_max_per_route(&target, 4);
        assert_eq!(pool.max_per_route(&target), 4);
        assert_eq!(pool.stats(&target).max, 4);
        assert_eq!(pool.total_stats().max, 3);
    }
}
