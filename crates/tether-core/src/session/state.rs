use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a terminal session
///
/// `Starting -> Active -> Closing -> Closed`, or `Starting -> Closing -> Closed`
/// when the shell never came up. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Starting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Atomic holder for [`SessionState`]
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Starting as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.get() == SessionState::Active
    }

    /// `Starting -> Active`
    pub fn activate(&self) -> bool {
        self.transition(SessionState::Starting, SessionState::Active)
    }

    /// Move to `Closing` from `Starting` or `Active`.
    ///
    /// Exactly one caller ever sees `true`; that caller owns teardown.
    pub fn begin_close(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Starting, SessionState::Closing)
    }

    /// `Closing -> Closed`
    pub fn finish_close(&self) -> bool {
        self.transition(SessionState::Closing, SessionState::Closed)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
