//! Bootstrap state: INIT -> DISCOVERING -> CONNECTED -> ANNOUNCED, advanced only by compare-and-swap.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapState {
    Init,
    Discovering,
    Connected,
    Announced,
}

impl BootstrapState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BootstrapState::Init,
            1 => BootstrapState::Discovering,
            2 => BootstrapState::Connected,
            _ => BootstrapState::Announced,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Single-fire gate over the bootstrap state. Shared by every task that can
/// observe a successful connection; exactly one of them wins `try_connect`.
#[derive(Debug)]
pub struct BootstrapGate {
    state: AtomicU8,
}

impl BootstrapGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(BootstrapState::Init.as_u8()),
        }
    }

    pub fn state(&self) -> BootstrapState {
        BootstrapState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// INIT -> DISCOVERING. Returns false if already past INIT.
    pub fn start_discovery(&self) -> bool {
        self.advance(BootstrapState::Init, BootstrapState::Discovering)
    }

    /// First successful connection. Returns true for exactly one caller over
    /// the gate's lifetime; that caller owns the announce step.
    pub fn try_connect(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= BootstrapState::Connected.as_u8() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                BootstrapState::Connected.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// CONNECTED -> ANNOUNCED, after a successful advertise.
    pub fn mark_announced(&self) -> bool {
        self.advance(BootstrapState::Connected, BootstrapState::Announced)
    }

    pub fn is_connected(&self) -> bool {
        self.state() >= BootstrapState::Connected
    }

    fn advance(&self, from: BootstrapState, to: BootstrapState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for BootstrapGate {
    fn default() -> Self {
        Self::new()
    }
}
