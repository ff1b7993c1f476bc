//! Lifecycle state and extension points shared by connections and sessions.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::NetError;

/// Lifecycle of a connection or session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    /// Usable: sends go out, received packets are delivered.
    Open = 0,
    /// Unavailable; waiting for the sweep to announce and close it.
    Closing = 1,
    /// Sockets released.
    Closed = 2,
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(PeerState::Open as u8))
    }

    pub(crate) fn get(&self) -> PeerState {
        match self.0.load(Ordering::Acquire) {
            0 => PeerState::Open,
            1 => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }

    /// `Open -> Closing`. Returns `true` if this call made the transition.
    pub(crate) fn begin_closing(&self) -> bool {
        self.0
            .compare_exchange(PeerState::Open as u8, PeerState::Closing as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Any state `-> Closed`. Returns `true` if this call made the transition.
    pub(crate) fn close(&self) -> bool {
        self.0.swap(PeerState::Closed as u8, Ordering::AcqRel) != PeerState::Closed as u8
    }
}

/// Overridable behaviour of a [`Connection`](crate::Connection) or
/// [`Session`](crate::Session), installed through the manager's factory.
///
/// Both methods default to doing nothing.
pub trait PeerHooks<P: ?Sized>: Send + Sync {
    /// A read or send failed. `cause` is the fault as raised; use
    /// [`NetError::root_cause`] for the innermost error. Called once per
    /// fault, before the peer (or, for sessions, the link) is dropped.
    fn on_transport_fault(&self, peer: &P, cause: &NetError) {
        let _ = (peer, cause);
    }

    /// Called on every sweep while a keep-alive timeout is configured, with the
    /// time since the last send or receive. Sending a packet from here resets
    /// the idle clock.
    fn on_idle(&self, peer: &P, idle: Duration) {
        let _ = (peer, idle);
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<P: ?Sized> PeerHooks<P> for NoHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_moves_forward() {
        let state = StateCell::new();
        assert_eq!(state.get(), PeerState::Open);
        assert!(state.begin_closing());
        assert!(!state.begin_closing());
        assert_eq!(state.get(), PeerState::Closing);
        assert!(state.close());
        assert!(!state.close());
        assert!(!state.begin_closing());
        assert_eq!(state.get(), PeerState::Closed);
    }

    #[test]
    fn close_from_open_skips_closing() {
        let state = StateCell::new();
        assert!(state.close());
        assert_eq!(state.get(), PeerState::Closed);
    }
}
