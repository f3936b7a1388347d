//! Datagram transport abstraction.
//!
//! The endpoint sits above anything that can move one datagram at a time to
//! a named peer — the production lower layer is a Wi-Fi Aware
//! publish/subscribe service, the tests use in-process channels.  All
//! protocol logic lives elsewhere; implementations of [`Transport`] own
//! only datagram I/O.

use std::fmt;

use bytes::Bytes;

/// Identifier tuple naming one connection to the datagram transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Local publish/subscribe instance id.
    pub id: u32,
    /// Peer instance id.
    pub peer_id: u32,
    /// Peer MAC address.
    pub peer_addr: [u8; 6],
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.peer_addr;
        write!(
            f,
            "session {} peer {} ({:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x})",
            self.id, self.peer_id, m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// One-datagram-at-a-time lower layer.
///
/// `send` is fire-and-forget: it must return promptly, and the eventual
/// outcome is reported later through
/// [`crate::endpoint::Endpoint::handle_send_confirmation`].  The endpoint
/// guarantees it never issues a second `send` before the previous one is
/// confirmed.
pub trait Transport: Send {
    /// Hand one encoded datagram to the lower layer.
    fn send(&mut self, session: &Session, datagram: Bytes);

    /// `true` if a subsequent `send` is expected to succeed.
    fn resource_available(&self) -> bool;

    /// Release any lower-layer context held for `session`.
    fn close_session(&mut self, session: &Session);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_display_formats_mac() {
        let s = Session {
            id: 3,
            peer_id: 9,
            peer_addr: [0xaa, 0xbb, 0x0c, 0x01, 0x02, 0x03],
        };
        assert_eq!(s.to_string(), "session 3 peer 9 (aa:bb:0c:01:02:03)");
    }
}
