//! Physical sessions and the commands they execute.
//!
//! A session is one transport connection. Work is handed to it by pushing
//! [`Command`]s onto its queue; the session's driver task executes commands in
//! queue order. Sessions report whether they are still open so the pool never
//! hands out a dead connection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cancel::CancellableHandle;
use crate::exchange::{ExchangeHandler, HttpContext, PushHandlerFactory};
use crate::h2::StreamId;
use crate::info::{ConnectionInfo, TlsConnectionInfo};
use crate::version::HttpProtocol;
use crate::Error;

mod queue;
pub use self::queue::CommandQueue;

static SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        Self(SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Where a command is placed in the session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Executed after every command already queued.
    #[default]
    Normal,

    /// Executed ahead of every normal command, in arrival order.
    Immediate,
}

/// How a session should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop accepting new work and finish what is in flight.
    Graceful,

    /// Abort everything in flight.
    Immediate,
}

/// An exchange waiting to be executed on a session.
pub struct ExecutableCommand {
    pub(crate) handler: Box<dyn ExchangeHandler>,
    pub(crate) push_factory: Option<Arc<dyn PushHandlerFactory>>,
    pub(crate) cancellable: CancellableHandle,
    pub(crate) context: HttpContext,
}

impl fmt::Debug for ExecutableCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableCommand")
            .field("push", &self.push_factory.is_some())
            .field("cancellable", &self.cancellable)
            .finish()
    }
}

impl ExecutableCommand {
    /// Bundle a handler with its cancellation handle and context.
    pub fn new(
        handler: Box<dyn ExchangeHandler>,
        push_factory: Option<Arc<dyn PushHandlerFactory>>,
        cancellable: CancellableHandle,
        context: HttpContext,
    ) -> Self {
        Self {
            handler,
            push_factory,
            cancellable,
            context,
        }
    }

    /// The handle which cancels this exchange.
    pub fn cancellable(&self) -> &CancellableHandle {
        &self.cancellable
    }

    /// Fail the exchange without running it.
    pub fn fail(mut self, error: Error) {
        self.handler.failed(error);
        self.handler.release_resources();
    }

    /// Cancel the exchange without running it.
    pub fn cancel(mut self) {
        self.handler.cancel();
        self.handler.release_resources();
    }
}

/// Work for a session's driver task.
#[derive(Debug)]
#[non_exhaustive]
pub enum Command {
    /// Run an exchange.
    Execute(Box<ExecutableCommand>),

    /// Close the session.
    Shutdown(CloseMode),

    /// Reset a stream and notify its handler of the cancellation.
    CancelStream(StreamId),

    /// A handler which produced no data has more to send.
    RequestOutput(StreamId),

    /// Grant the peer more receive credit on a stream.
    UpdateCapacity(StreamId, u32),

    /// Drop cancelled exchanges from the pending submission queue.
    SweepPending,
}

impl Command {
    /// Fail the exchange carried by this command, if any.
    pub fn fail(self, error: Error) {
        if let Command::Execute(command) = self {
            command.fail(error);
        }
    }
}

/// One physical connection which executes commands.
pub trait Session: Send + Sync {
    /// Identifier for logging and pool bookkeeping.
    fn id(&self) -> SessionId;

    /// The protocol this session speaks.
    fn protocol(&self) -> HttpProtocol;

    /// Can the session accept new work?
    fn is_open(&self) -> bool;

    /// Queue a command. Commands queued on a closed session are failed with
    /// [`Error::ConnectionClosed`].
    fn enqueue(&self, command: Command, priority: Priority);

    /// Close the session.
    fn close(&self, mode: CloseMode);

    /// Addresses of the underlying connection.
    fn info(&self) -> &ConnectionInfo;

    /// TLS details, when the connection is encrypted.
    fn tls_info(&self) -> Option<&TlsConnectionInfo>;
}

/// Push a command onto a queue, failing it if the queue is closed.
pub(crate) fn enqueue_or_fail(queue: &CommandQueue, command: Command, priority: Priority) {
    if let Err(command) = queue.push(command, priority) {
        tracing::trace!("session closed, failing command");
        command.fail(Error::ConnectionClosed);
    }
}

/// Shuts a session down gracefully once every handle to it is gone.
pub(crate) struct CloseOnDrop {
    queue: Arc<CommandQueue>,
}

impl CloseOnDrop {
    pub(crate) fn new(queue: Arc<CommandQueue>) -> Self {
        Self { queue }
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let _ = self
            .queue
            .push(Command::Shutdown(CloseMode::Graceful), Priority::Normal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("session-"));
    }
}
