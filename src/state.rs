//! Connection finite-state-machine types and flag sets.
//!
//! This module defines every state an [`crate::endpoint::Endpoint`] can
//! occupy plus the two small bitsets the endpoint consults on each event.
//! State transitions are *not* implemented here — they live in
//! [`crate::endpoint`] — keeping the types free of plumbing so guard logic
//! and tracing can be added without touching the endpoint itself.

use std::fmt;

/// All possible states of the endpoint FSM.
///
/// ```text
//  Subscriber:  Ready ──StartConnect──▶ Connecting ──response──▶ Connected
//  Publisher:   Ready ──request rcvd──▶ Connecting ──response sent──▶ Connected
//                                           │ (no common version)
//                                           ▼
//                                       Aborting ──response confirmed──▶ Closed
//  Connected ──graceful close, tx pending──▶ Closing ──drained──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Initialized, no handshake traffic yet.
    Ready,
    /// Capability handshake in progress.
    Connecting,
    /// Handshake complete; data transfer allowed.
    Connected,
    /// Graceful close requested with data still in flight.
    Closing,
    /// Terminal; no further callbacks or sends.
    Closed,
    /// Version negotiation failed; tearing down after the response goes out.
    Aborting,
}

impl EndpointState {
    /// `true` while application data may still be submitted.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Closing)
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which side of the handshake this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waits for a capabilities request and answers it.
    Publisher,
    /// Initiates the handshake with a capabilities request.
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Connection-state flags
// ---------------------------------------------------------------------------

/// One-bit facts about the connection, consulted on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnFlag {
    /// A datagram has been handed to the transport and not yet confirmed.
    /// Gates *all* sends: at most one datagram is outstanding at a time.
    OpInFlight,
    /// The outstanding datagram is a standalone ack.
    StandaloneAckInFlight,
    /// The peer's half of the capability handshake has arrived.
    CapabilitiesMsgReceived,
    /// Our half of the capability handshake has been confirmed sent.
    CapabilitiesConfReceived,
}

impl ConnFlag {
    fn bit(self) -> u8 {
        match self {
            Self::OpInFlight => 0b0001,
            Self::StandaloneAckInFlight => 0b0010,
            Self::CapabilitiesMsgReceived => 0b0100,
            Self::CapabilitiesConfReceived => 0b1000,
        }
    }
}

/// Compact set of [`ConnFlag`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnFlags(u8);

impl ConnFlags {
    pub fn has(self, flag: ConnFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn set(&mut self, flag: ConnFlag) {
        self.0 |= flag.bit();
    }

    pub fn clear(&mut self, flag: ConnFlag) {
        self.0 &= !flag.bit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_connected_covers_closing() {
        assert!(EndpointState::Connected.is_connected());
        assert!(EndpointState::Closing.is_connected());
        assert!(!EndpointState::Ready.is_connected());
        assert!(!EndpointState::Closed.is_connected());
        assert!(!EndpointState::Aborting.is_connected());
    }

    #[test]
    fn conn_flags_set_and_clear() {
        let mut f = ConnFlags::default();
        assert!(!f.has(ConnFlag::OpInFlight));
        f.set(ConnFlag::OpInFlight);
        f.set(ConnFlag::CapabilitiesMsgReceived);
        assert!(f.has(ConnFlag::OpInFlight));
        assert!(f.has(ConnFlag::CapabilitiesMsgReceived));
        f.clear(ConnFlag::OpInFlight);
        assert!(!f.has(ConnFlag::OpInFlight));
        assert!(f.has(ConnFlag::CapabilitiesMsgReceived));
    }
}
