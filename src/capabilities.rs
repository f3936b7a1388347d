//! Open-time capability handshake messages.
//!
//! Before any application data flows, the subscriber writes a capabilities
//! *request* (supported protocol versions, observed MTU, receive window) and
//! the publisher answers with a capabilities *response* (selected version,
//! fragment size, window).  Both are handshake-flagged datagrams carrying a
//! management opcode; neither is sequenced.
//!
//! # Wire formats
//!
//! ```text
//!  request:   [flags][opcode=1]["nlPAFTP"][4 × version-nibble pairs][mtu LE][window]
//!  response:  [flags][opcode=2][selected version][fragment size LE][window]
//! ```
//!
//! Versions travel as nibbles, two per byte, low nibble first; empty slots
//! are zero.  Version 0 is the "no compatible version" sentinel.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::flags;

/// Lowest protocol version this implementation speaks.
pub const MIN_VERSION: u8 = 4;
/// Highest protocol version this implementation speaks.
pub const MAX_VERSION: u8 = 4;
/// Sentinel meaning "no version supported by both peers".
pub const VERSION_NONE: u8 = 0;

/// Management opcode of the capabilities request.
pub const OPCODE_REQUEST: u8 = 0x01;
/// Management opcode of the capabilities response.
pub const OPCODE_RESPONSE: u8 = 0x02;

/// Magic preamble identifying a capabilities request.
pub const MAGIC: &[u8; 7] = b"nlPAFTP";

/// Number of version nibbles a request can carry.
pub const NUM_VERSION_SLOTS: usize = 8;

/// MTU advertised when the lower layer did not report one.
pub const DEFAULT_MTU: u16 = 244;

/// Largest fragment this implementation will ever use, datagram headers
/// included.
pub const MAX_FRAGMENT_SIZE: u16 = 244;

/// Most sequence numbers we are willing to leave unacknowledged on receive.
pub const MAX_RECEIVE_WINDOW: u8 = 4;

/// Exact on-wire length of a request.
pub const REQUEST_SIZE: usize = 2 + MAGIC.len() + NUM_VERSION_SLOTS / 2 + 2 + 1;
/// Exact on-wire length of a response.
pub const RESPONSE_SIZE: usize = 2 + 1 + 2 + 1;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Capabilities request: subscriber → publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitiesRequest {
    /// Supported protocol versions as nibbles, highest first; zero = empty.
    pub versions: [u8; NUM_VERSION_SLOTS],
    /// Lower-layer MTU as observed by the requester, or zero if unknown.
    pub mtu: u16,
    /// Receive window the requester can afford, in sequence numbers.
    pub window_size: u8,
}

impl CapabilitiesRequest {
    /// Build the request this implementation sends, advertising its own
    /// version range (highest first), MTU, and receive window.
    pub fn local() -> Self {
        let mut versions = [0u8; NUM_VERSION_SLOTS];
        for (slot, v) in (MIN_VERSION..=MAX_VERSION).rev().enumerate() {
            versions[slot] = v;
        }
        Self {
            versions,
            mtu: DEFAULT_MTU,
            window_size: MAX_RECEIVE_WINDOW,
        }
    }

    /// `true` when `version` appears in the advertised vector.
    pub fn supports(&self, version: u8) -> bool {
        version != VERSION_NONE && self.versions.contains(&version)
    }

    /// Serialise into a complete handshake datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_SIZE);
        buf.put_u8(flags::HANDSHAKE | flags::MANAGEMENT_OPCODE);
        buf.put_u8(OPCODE_REQUEST);
        buf.put_slice(MAGIC);
        for pair in self.versions.chunks(2) {
            // Low nibble first.
            buf.put_u8((pair[0] & 0x0F) | (pair[1] << 4));
        }
        buf.put_u16_le(self.mtu);
        buf.put_u8(self.window_size);
        buf.freeze()
    }

    /// Parse a request from a complete handshake datagram.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQUEST_SIZE {
            return Err(Error::ProtocolAbort);
        }
        if buf[0] & (flags::HANDSHAKE | flags::MANAGEMENT_OPCODE)
            != flags::HANDSHAKE | flags::MANAGEMENT_OPCODE
            || buf[1] != OPCODE_REQUEST
        {
            return Err(Error::ProtocolAbort);
        }
        if &buf[2..2 + MAGIC.len()] != MAGIC {
            return Err(Error::ProtocolAbort);
        }

        let mut versions = [0u8; NUM_VERSION_SLOTS];
        let nibbles = &buf[2 + MAGIC.len()..2 + MAGIC.len() + NUM_VERSION_SLOTS / 2];
        for (i, byte) in nibbles.iter().enumerate() {
            versions[2 * i] = byte & 0x0F;
            versions[2 * i + 1] = byte >> 4;
        }
        let off = 2 + MAGIC.len() + NUM_VERSION_SLOTS / 2;
        let mtu = u16::from_le_bytes([buf[off], buf[off + 1]]);
        let window_size = buf[off + 2];

        Ok(Self {
            versions,
            mtu,
            window_size,
        })
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Capabilities response: publisher → subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitiesResponse {
    /// The protocol version the responder selected, or [`VERSION_NONE`].
    pub selected_version: u8,
    /// Fragment size both directions will use, headers included.
    pub fragment_size: u16,
    /// Receive window granted to both sides, in sequence numbers.
    pub window_size: u8,
}

impl CapabilitiesResponse {
    /// Serialise into a complete handshake datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_SIZE);
        buf.put_u8(flags::HANDSHAKE | flags::MANAGEMENT_OPCODE);
        buf.put_u8(OPCODE_RESPONSE);
        buf.put_u8(self.selected_version & 0x0F);
        buf.put_u16_le(self.fragment_size);
        buf.put_u8(self.window_size);
        buf.freeze()
    }

    /// Parse a response from a complete handshake datagram.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RESPONSE_SIZE {
            return Err(Error::ProtocolAbort);
        }
        if buf[0] & (flags::HANDSHAKE | flags::MANAGEMENT_OPCODE)
            != flags::HANDSHAKE | flags::MANAGEMENT_OPCODE
            || buf[1] != OPCODE_RESPONSE
        {
            return Err(Error::ProtocolAbort);
        }
        Ok(Self {
            selected_version: buf[2] & 0x0F,
            fragment_size: u16::from_le_bytes([buf[3], buf[4]]),
            window_size: buf[5],
        })
    }
}

/// Responder-side version selection: the numerically highest version in our
/// own `[MIN_VERSION, MAX_VERSION]` range that the requester also advertises,
/// or [`VERSION_NONE`] when the ranges do not overlap.
pub fn select_version(req: &CapabilitiesRequest) -> u8 {
    for v in (MIN_VERSION..=MAX_VERSION).rev() {
        if req.supports(v) {
            return v;
        }
    }
    VERSION_NONE
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = CapabilitiesRequest::local();
        let bytes = req.encode();
        assert_eq!(bytes.len(), REQUEST_SIZE);
        assert_eq!(CapabilitiesRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn request_carries_magic() {
        let bytes = CapabilitiesRequest::local().encode();
        assert_eq!(&bytes[2..9], MAGIC);
    }

    #[test]
    fn request_bad_magic_rejected() {
        let mut bytes = CapabilitiesRequest::local().encode().to_vec();
        bytes[2] = b'x';
        assert!(CapabilitiesRequest::decode(&bytes).is_err());
    }

    #[test]
    fn request_nibble_packing() {
        let mut req = CapabilitiesRequest::local();
        req.versions = [6, 5, 4, 3, 0, 0, 0, 0];
        let bytes = req.encode();
        // Low nibble first: (6,5) -> 0x56, (4,3) -> 0x34.
        assert_eq!(bytes[9], 0x56);
        assert_eq!(bytes[10], 0x34);
        assert_eq!(CapabilitiesRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn response_roundtrip() {
        let resp = CapabilitiesResponse {
            selected_version: 4,
            fragment_size: 244,
            window_size: 4,
        };
        let bytes = resp.encode();
        assert_eq!(bytes.len(), RESPONSE_SIZE);
        assert_eq!(CapabilitiesResponse::decode(&bytes).unwrap(), resp);
    }

    #[test]
    fn response_fragment_size_little_endian() {
        let resp = CapabilitiesResponse {
            selected_version: 4,
            fragment_size: 0x0201,
            window_size: 1,
        };
        let bytes = resp.encode();
        assert_eq!(bytes[3], 0x01);
        assert_eq!(bytes[4], 0x02);
    }

    #[test]
    fn select_version_picks_highest_common() {
        let mut req = CapabilitiesRequest::local();
        req.versions = [9, 4, 2, 0, 0, 0, 0, 0];
        assert_eq!(select_version(&req), 4);
    }

    #[test]
    fn select_version_none_when_disjoint() {
        let mut req = CapabilitiesRequest::local();
        req.versions = [2, 1, 0, 0, 0, 0, 0, 0];
        assert_eq!(select_version(&req), VERSION_NONE);
    }

    #[test]
    fn truncated_messages_rejected() {
        assert!(CapabilitiesRequest::decode(&[0x30, 0x01]).is_err());
        assert!(CapabilitiesResponse::decode(&[0x30, 0x02, 0x04]).is_err());
    }
}
