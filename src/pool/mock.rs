//! Mock sessions and connectors for exercising the pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use super::PoolableSession;
use crate::conn::ConnectRequest;
use crate::info::{ConnectionInfo, TlsConnectionInfo};
use crate::session::{CloseMode, Command, Priority, Session, SessionId};
use crate::version::HttpProtocol;
use crate::{BoxFuture, Error};

/// The mock connector was told to fail.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("mock connection failed")]
pub struct MockConnectionError;

#[derive(Debug)]
struct MockState {
    open: AtomicBool,
    valid: AtomicBool,
    commands: Mutex<Vec<Command>>,
}

/// A session which records the commands queued on it.
#[derive(Debug, Clone)]
pub struct MockSession {
    id: SessionId,
    shared: bool,
    info: ConnectionInfo,
    state: Arc<MockState>,
}

impl MockSession {
    fn new(shared: bool) -> Self {
        Self {
            id: SessionId::next(),
            shared,
            info: ConnectionInfo::default(),
            state: Arc::new(MockState {
                open: AtomicBool::new(true),
                valid: AtomicBool::new(true),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A session leased to one borrower at a time, like HTTP/1.1.
    pub fn exclusive() -> Self {
        Self::new(false)
    }

    /// A multiplexed session, like HTTP/2.
    pub fn shared() -> Self {
        Self::new(true)
    }

    /// Decide the outcome of the next validation probe.
    pub fn set_valid(&self, valid: bool) {
        self.state.valid.store(valid, Ordering::SeqCst);
    }

    /// Number of commands queued so far.
    pub fn queued(&self) -> usize {
        self.state.commands.lock().len()
    }

    /// Take the queued commands.
    pub fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut *self.state.commands.lock())
    }
}

impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn protocol(&self) -> HttpProtocol {
        if self.shared {
            HttpProtocol::Http2
        } else {
            HttpProtocol::Http1
        }
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn enqueue(&self, command: Command, _priority: Priority) {
        if self.is_open() {
            self.state.commands.lock().push(command);
        } else {
            command.fail(Error::ConnectionClosed);
        }
    }

    fn close(&self, mode: CloseMode) {
        trace!(session = %self.id, ?mode, "mock session closed");
        self.state.open.store(false, Ordering::SeqCst);
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn tls_info(&self) -> Option<&TlsConnectionInfo> {
        None
    }
}

impl PoolableSession for MockSession {
    fn validate(&self) -> bool {
        self.is_open() && self.state.valid.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct ConnectorState {
    fail: AtomicBool,
    connects: AtomicUsize,
    sessions: Mutex<Vec<MockSession>>,
}

/// A connector producing [`MockSession`]s.
#[derive(Debug, Clone)]
pub struct MockConnector {
    shared: bool,
    delay: Option<Duration>,
    state: Arc<ConnectorState>,
}

impl MockConnector {
    fn new(shared: bool) -> Self {
        Self {
            shared,
            delay: None,
            state: Arc::new(ConnectorState {
                fail: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Produce exclusive sessions.
    pub fn exclusive() -> Self {
        Self::new(false)
    }

    /// Produce multiplexed sessions.
    pub fn shared() -> Self {
        Self::new(true)
    }

    /// Take `delay` to connect.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make subsequent connects fail.
    pub fn set_fail(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of connects started.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Every session produced so far.
    pub fn sessions(&self) -> Vec<MockSession> {
        self.state.sessions.lock().clone()
    }
}

impl tower::Service<ConnectRequest> for MockConnector {
    type Response = MockSession;
    type Error = Error;
    type Future = BoxFuture<'static, Result<MockSession, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ConnectRequest) -> Self::Future {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let fail = self.state.fail.load(Ordering::SeqCst);
        let shared = self.shared;
        let delay = self.delay;
        let state = self.state.clone();

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(Error::connect(MockConnectionError));
            }

            let session = MockSession::new(shared);
            trace!(session = %session.id(), target = %request.target, "mock connected");
            state.sessions.lock().push(session.clone());
            Ok(session)
        })
    }
}
