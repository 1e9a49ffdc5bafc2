//! Cancellation of operations whose underlying resource is not known yet.
//!
//! A [`CancellableHandle`] is handed to the caller as soon as an exchange is
//! submitted. At that point the exchange may still be waiting for a pooled
//! session, so there is nothing concrete to cancel. As the exchange makes
//! progress the handle is pointed at the current dependency (first the lease,
//! later the stream), and cancelling the handle cancels whichever dependency
//! is attached, or the next one attached if the handle was cancelled first.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// An operation which can be cancelled.
pub trait Cancellable: Send + Sync {
    /// Request cancellation.
    ///
    /// Returns `true` if this call caused the operation to be cancelled,
    /// and `false` if it was already cancelled or already finished.
    fn cancel(&self) -> bool;
}

enum State {
    Pending(Option<Box<dyn Cancellable>>),
    Cancelled,
    Completed,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Pending(Some(_)) => f.write_str("Pending(attached)"),
            State::Pending(None) => f.write_str("Pending"),
            State::Cancelled => f.write_str("Cancelled"),
            State::Completed => f.write_str("Completed"),
        }
    }
}

/// A tri-state (pending, cancelled, completed) cancellation guard.
///
/// Clones share state. A dependency attached with
/// [`set_dependency`](CancellableHandle::set_dependency) is cancelled at most
/// once, no matter how calls to `cancel` and `set_dependency` interleave
/// across threads.
#[derive(Clone)]
pub struct CancellableHandle {
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for CancellableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancellableHandle")
            .field(&*self.state.lock())
            .finish()
    }
}

impl Default for CancellableHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellableHandle {
    /// Create a new pending handle with no dependency.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(None))),
        }
    }

    /// Attach the operation this handle currently guards.
    ///
    /// Replaces (without cancelling) any previously attached dependency. If
    /// the handle has already been cancelled, `dependency` is cancelled right
    /// away and not retained. Once completed, the dependency is dropped.
    pub fn set_dependency(&self, dependency: Box<dyn Cancellable>) {
        let mut state = self.state.lock();
        if let State::Pending(slot) = &mut *state {
            *slot = Some(dependency);
            return;
        }

        let cancelled = matches!(*state, State::Cancelled);
        drop(state);
        if cancelled {
            tracing::trace!("handle already cancelled, cancelling new dependency");
            dependency.cancel();
        }
    }

    /// Cancel the guarded operation.
    ///
    /// Only the first call on a pending handle has any effect, and it returns
    /// `true`.
    pub fn cancel(&self) -> bool {
        let dependency = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Cancelled) {
                State::Pending(dependency) => dependency,
                previous => {
                    *state = previous;
                    return false;
                }
            }
        };

        if let Some(dependency) = dependency {
            dependency.cancel();
        }
        true
    }

    /// Mark the guarded operation as finished.
    ///
    /// Later calls to `cancel` return `false`. Returns `true` if the handle
    /// was still pending.
    pub fn complete(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending(_)) {
            *state = State::Completed;
            true
        } else {
            false
        }
    }

    /// Has this handle been cancelled?
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), State::Cancelled)
    }

    /// Has the guarded operation completed?
    pub fn is_completed(&self) -> bool {
        matches!(*self.state.lock(), State::Completed)
    }
}

impl Cancellable for CancellableHandle {
    fn cancel(&self) -> bool {
        CancellableHandle::cancel(self)
    }
}
