//! Flow-control windows.
//!
//! Windows are signed: a SETTINGS change that shrinks the initial window size
//! applies to windows already in use and may push them below zero. Nothing
//! may be sent on a window until replenishment makes it positive again.

use super::frame::Reason;

/// Default initial window size for streams and the connection.
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Largest legal window size, 2^31 - 1.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// A window change would violate flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow control window violated")]
pub struct FlowControlError;

impl From<FlowControlError> for Reason {
    fn from(_: FlowControlError) -> Self {
        Reason::FLOW_CONTROL_ERROR
    }
}

/// A send or receive window for a stream or the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    window: i64,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl FlowControl {
    /// A window starting at `initial` bytes.
    pub fn new(initial: u32) -> Self {
        Self {
            window: i64::from(initial),
        }
    }

    /// Current window, possibly negative.
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes which may be sent now; zero while the window is not positive.
    pub fn available(&self) -> u32 {
        u32::try_from(self.window.max(0)).unwrap_or(MAX_WINDOW_SIZE)
    }

    /// Spend `amount` bytes. Fails, leaving the window unchanged, if the
    /// window does not cover them.
    pub fn consume(&mut self, amount: u32) -> Result<(), FlowControlError> {
        let next = self.window - i64::from(amount);
        if next < 0 {
            return Err(FlowControlError);
        }
        self.window = next;
        Ok(())
    }

    /// Add credit from a WINDOW_UPDATE. The window may not exceed 2^31 - 1.
    pub fn increase(&mut self, increment: u32) -> Result<(), FlowControlError> {
        let next = self.window + i64::from(increment);
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowControlError);
        }
        self.window = next;
        Ok(())
    }

    /// Apply a change of the initial window size (`new - old`), which may be
    /// negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), FlowControlError> {
        let next = self.window + delta;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowControlError);
        }
        self.window = next;
        Ok(())
    }
}
