use std::collections::VecDeque;
use std::fmt;
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use parking_lot::Mutex;

use super::{Command, Priority};

#[derive(Debug, Default)]
struct State {
    immediate: VecDeque<Command>,
    normal: VecDeque<Command>,
    closed: bool,
}

impl State {
    fn pop(&mut self) -> Option<Command> {
        self.immediate.pop_front().or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.immediate.len() + self.normal.len()
    }
}

/// The ordered command queue of one session.
///
/// Any thread may push; only the session's driver task pops.
#[derive(Default)]
pub struct CommandQueue {
    state: Mutex<State>,
    waker: AtomicWaker,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommandQueue")
            .field("pending", &state.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl CommandQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command, waking the driver.
    ///
    /// Returns the command if the queue has been closed.
    pub fn push(&self, command: Command, priority: Priority) -> Result<(), Command> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(command);
            }
            match priority {
                Priority::Normal => state.normal.push_back(command),
                Priority::Immediate => state.immediate.push_back(command),
            }
        }
        self.waker.wake();
        Ok(())
    }

    /// Take the next command without registering for wakeups.
    pub fn try_pop(&self) -> Option<Command> {
        self.state.lock().pop()
    }

    /// Poll for the next command.
    ///
    /// Resolves to `None` once the queue is closed and empty.
    pub fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Command>> {
        if let Some(command) = self.try_pop() {
            return Poll::Ready(Some(command));
        }

        self.waker.register(cx.waker());

        let mut state = self.state.lock();
        match state.pop() {
            Some(command) => Poll::Ready(Some(command)),
            None if state.closed => Poll::Ready(None),
            None => Poll::Pending,
        }
    }

    /// Close the queue, returning every command that was never taken.
    pub fn close(&self) -> Vec<Command> {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            let State {
                immediate, normal, ..
            } = &mut *state;
            immediate.drain(..).chain(normal.drain(..)).collect()
        };
        self.waker.wake();
        drained
    }

    /// Has the queue been closed?
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of commands waiting.
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
