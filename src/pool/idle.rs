use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::{Config, PoolableSession, ReusePolicy};
use crate::session::CloseMode;

/// Lifetime bookkeeping shared by idle and multiplexed sessions.
#[derive(Debug, Clone, Copy)]
pub(super) struct Age {
    pub(super) created: Instant,
    pub(super) since: Instant,
}

impl Age {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            created: now,
            since: now,
        }
    }

    /// Past its time to live?
    pub(super) fn outlived(&self, config: &Config, now: Instant) -> bool {
        config
            .time_to_live
            .is_some_and(|ttl| now.saturating_duration_since(self.created) >= ttl)
    }

    /// Past its time to live, or idle for longer than allowed?
    pub(super) fn is_expired(&self, config: &Config, now: Instant) -> bool {
        let idle = config
            .idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .is_some_and(|timeout| now.saturating_duration_since(self.since) >= timeout);
        self.outlived(config, now) || idle
    }

    /// Has the session been idle long enough to need validation?
    pub(super) fn needs_validation(&self, config: &Config, now: Instant) -> bool {
        config
            .validate_after_inactivity
            .is_some_and(|after| now.saturating_duration_since(self.since) >= after)
    }
}

/// Decide whether a session which sat idle may be handed out again.
pub(super) fn usable<S: PoolableSession>(session: &S, age: &Age, config: &Config, now: Instant) -> bool {
    if !session.is_open() {
        trace!(session = %session.id(), "found closed session");
        return false;
    }

    if age.is_expired(config, now) {
        trace!(session = %session.id(), "found expired session");
        return false;
    }

    if age.needs_validation(config, now) && !session.validate() {
        trace!(session = %session.id(), "session failed validation");
        return false;
    }

    true
}

#[derive(Debug)]
pub(super) struct Idle<S> {
    pub(super) age: Age,
    pub(super) session: S,
}

/// Exclusive sessions waiting to be leased again, oldest first.
#[derive(Debug)]
pub(super) struct IdleSessions<S> {
    inner: VecDeque<Idle<S>>,
}

impl<S> Default for IdleSessions<S> {
    fn default() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }
}

impl<S: PoolableSession> IdleSessions<S> {
    pub(super) fn push(&mut self, session: S, created: Instant, now: Instant) {
        self.inner.push_back(Idle {
            age: Age {
                created,
                since: now,
            },
            session,
        });
    }

    /// Take a usable session, closing every unusable one found on the way.
    ///
    /// Returns the session (if any) and the number of sessions discarded.
    pub(super) fn pop(&mut self, config: &Config, now: Instant) -> (Option<Idle<S>>, usize) {
        let mut discarded = 0;

        trace!("checking {} idle sessions", self.len());
        loop {
            let entry = match config.reuse_policy {
                ReusePolicy::Lifo => self.inner.pop_back(),
                ReusePolicy::Fifo => self.inner.pop_front(),
            };
            let Some(entry) = entry else {
                return (None, discarded);
            };

            if usable(&entry.session, &entry.age, config, now) {
                trace!(session = %entry.session.id(), "found idle session");
                return (Some(entry), discarded);
            }

            entry.session.close(CloseMode::Immediate);
            discarded += 1;
        }
    }

    /// Close sessions matching `predicate`. Returns how many were closed.
    pub(super) fn close_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&Idle<S>) -> bool,
    {
        let before = self.inner.len();
        self.inner.retain(|entry| {
            if predicate(entry) {
                entry.session.close(CloseMode::Immediate);
                false
            } else {
                true
            }
        });
        before - self.inner.len()
    }

    /// Close sessions idle for at least `idle`.
    pub(super) fn close_idle(&mut self, idle: Duration, now: Instant) -> usize {
        self.close_where(|entry| now.saturating_duration_since(entry.age.since) >= idle)
    }

    /// When the least recently used session went idle.
    pub(super) fn oldest(&self) -> Option<Instant> {
        self.inner.iter().map(|entry| entry.age.since).min()
    }

    /// Close the least recently used session.
    pub(super) fn evict_oldest(&mut self) -> bool {
        let Some(index) = self
            .inner
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.age.since)
            .map(|(index, _)| index)
        else {
            return false;
        };

        if let Some(entry) = self.inner.remove(index) {
            trace!(session = %entry.session.id(), "evicting idle session");
            entry.session.close(CloseMode::Immediate);
        }
        true
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Close everything.
    pub(super) fn clear(&mut self) {
        for entry in self.inner.drain(..) {
            entry.session.close(CloseMode::Immediate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::mock::MockSession;
    use crate::session::Session;

    fn config() -> Config {
        Config {
            idle_timeout: None,
            validate_after_inactivity: None,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn lifo_and_fifo() {
        let now = Instant::now();
        let first = MockSession::exclusive();
        let second = MockSession::exclusive();

        let mut idle = IdleSessions::default();
        idle.push(first.clone(), now, now);
        idle.push(second.clone(), now, now);
        assert_eq!(idle.len(), 2);

        let (entry, discarded) = idle.pop(&config(), now);
        assert_eq!(entry.unwrap().session.id(), second.id());
        assert_eq!(discarded, 0);

        idle.push(second.clone(), now, now);
        let fifo = Config {
            reuse_policy: ReusePolicy::Fifo,
            ..config()
        };
        let (entry, _) = idle.pop(&fifo, now);
        assert_eq!(entry.unwrap().session.id(), first.id());
    }

    #[tokio::test]
    async fn closed_sessions_are_discarded() {
        let now = Instant::now();
        let closed = MockSession::exclusive();
        closed.close(CloseMode::Immediate);

        let mut idle = IdleSessions::default();
        idle.push(closed, now, now);

        let (entry, discarded) = idle.pop(&config(), now);
        assert!(entry.is_none());
        assert_eq!(discarded, 1);
        assert!(idle.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_and_validation() {
        let created = Instant::now();
        let expired = MockSession::exclusive();
        let invalid = MockSession::exclusive();
        invalid.set_valid(false);

        let mut idle = IdleSessions::default();
        idle.push(expired.clone(), created, created);
        tokio::time::advance(Duration::from_secs(5)).await;
        let now = Instant::now();
        idle.push(invalid.clone(), now, now);
        tokio::time::advance(Duration::from_secs(3)).await;

        let config = Config {
            time_to_live: Some(Duration::from_secs(6)),
            validate_after_inactivity: Some(Duration::from_secs(2)),
            ..config()
        };
        let (entry, discarded) = idle.pop(&config, Instant::now());
        assert!(entry.is_none());
        assert_eq!(discarded, 2);
        assert!(!expired.is_open());
        assert!(!invalid.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn close_idle_and_evict() {
        let mut idle = IdleSessions::default();
        let old = MockSession::exclusive();
        let now = Instant::now();
        idle.push(old.clone(), now, now);
        tokio::time::advance(Duration::from_secs(10)).await;
        let young = MockSession::exclusive();
        let now = Instant::now();
        idle.push(young.clone(), now, now);

        assert_eq!(idle.oldest().unwrap() + Duration::from_secs(10), now);
        assert_eq!(idle.close_idle(Duration::from_secs(5), now), 1);
        assert!(!old.is_open());

        assert!(idle.evict_oldest());
        assert!(!young.is_open());
        assert!(!idle.evict_oldest());
    }
}
