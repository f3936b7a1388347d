//! Wire-format definitions for protocol datagrams.
//!
//! Every frame exchanged between peers begins with a one-byte header-flags
//! field; the flags determine which of the optional fields follow.  This
//! module is responsible for:
//! - Defining the on-wire binary layout (flag bits, optional fields, payload).
//! - Serialising a [`Datagram`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Datagram`], returning
//!   errors for malformed or truncated input.
//! - Peeking the sequence number of a raw frame without consuming it, which
//!   the receive path needs before deciding whether to reorder.
//!
//! All multi-byte integers are little-endian.  No I/O happens here — this is
//! pure data transformation.
//!
//! # Layout
//!
//! ```text
//!  ┌───────┬─────────┬─────┬─────┬───────────┬─────────┐
//!  │ flags │ mgmt op │ ack │ seq │ total len │ payload │
//!  │  (1)  │  (0/1)  │(0/1)│ (1) │   (0/2)   │  (0..)  │
//!  └───────┴─────────┴─────┴─────┴───────────┴─────────┘
//! ```
//!
//! The sequence number is present on every non-handshake datagram; the
//! total-length field is present only on fragments that start a message.
//! A standalone ack is exactly `flags + ack + seq` = 3 bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::seq::SequenceNumber;

/// Bit-flag constants for the header-flags byte.
pub mod flags {
    /// Payload begins a new application message.
    pub const START_MESSAGE: u8 = 0b0000_0001;
    /// Payload continues the in-progress message.
    pub const CONTINUE_MESSAGE: u8 = 0b0000_0010;
    /// Payload completes the in-progress message.
    pub const END_MESSAGE: u8 = 0b0000_0100;
    /// An ack-number field is present.
    pub const FRAGMENT_ACK: u8 = 0b0000_1000;
    /// This is a capabilities request/response; no sequence number follows.
    pub const HANDSHAKE: u8 = 0b0001_0000;
    /// A one-byte management opcode field is present.
    pub const MANAGEMENT_OPCODE: u8 = 0b0010_0000;
    /// Bits that must be zero on the wire.
    pub const RESERVED_MASK: u8 = 0b1100_0000;
}

/// Size of the header-flags field in bytes.
pub const FLAGS_SIZE: usize = 1;
/// Size of the management-opcode field in bytes.
pub const MGMT_OP_SIZE: usize = 1;
/// Size of the ack-number field in bytes.
pub const ACK_SIZE: usize = 1;
/// Size of the sequence-number field in bytes.
pub const SEQ_SIZE: usize = 1;
/// Size of the total-message-length field in bytes.
pub const TOTAL_LEN_SIZE: usize = 2;
/// A standalone ack is `flags + ack + seq`, nothing else.
pub const STANDALONE_ACK_SIZE: usize = FLAGS_SIZE + ACK_SIZE + SEQ_SIZE;

/// A decoded protocol datagram.
///
/// Optional fields mirror the flag bits: constructors keep them consistent,
/// and [`Datagram::decode`] derives field presence from the flags byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Raw header-flags byte (see [`flags`]).
    pub flags: u8,
    /// Management opcode, present when [`flags::MANAGEMENT_OPCODE`] is set.
    pub mgmt_opcode: Option<u8>,
    /// Acknowledged sequence number, present when [`flags::FRAGMENT_ACK`] is set.
    pub ack_num: Option<SequenceNumber>,
    /// Sequence number; present on every non-handshake datagram.
    pub seq_num: Option<SequenceNumber>,
    /// Declared total message length, present when [`flags::START_MESSAGE`] is set.
    pub total_length: Option<u16>,
    /// Fragment payload (may be empty).
    pub payload: Bytes,
}

impl Datagram {
    /// Build a data fragment carrying `payload`.
    ///
    /// `position_flags` is some combination of [`flags::START_MESSAGE`],
    /// [`flags::CONTINUE_MESSAGE`] and [`flags::END_MESSAGE`];
    /// `total_length` must be `Some` exactly when the fragment starts a
    /// message.
    pub fn fragment(
        position_flags: u8,
        ack_num: Option<SequenceNumber>,
        seq_num: SequenceNumber,
        total_length: Option<u16>,
        payload: Bytes,
    ) -> Self {
        let mut hdr = position_flags;
        if ack_num.is_some() {
            hdr |= flags::FRAGMENT_ACK;
        }
        debug_assert_eq!(
            total_length.is_some(),
            position_flags & flags::START_MESSAGE != 0
        );
        Self {
            flags: hdr,
            mgmt_opcode: None,
            ack_num,
            seq_num: Some(seq_num),
            total_length,
            payload,
        }
    }

    /// Build a standalone ack: a payload-less datagram carrying only an
    /// acknowledgement and its own sequence number.
    pub fn standalone_ack(ack_num: SequenceNumber, seq_num: SequenceNumber) -> Self {
        Self {
            flags: flags::FRAGMENT_ACK,
            mgmt_opcode: None,
            ack_num: Some(ack_num),
            seq_num: Some(seq_num),
            total_length: None,
            payload: Bytes::new(),
        }
    }

    /// Serialise this datagram into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            FLAGS_SIZE
                + MGMT_OP_SIZE
                + ACK_SIZE
                + SEQ_SIZE
                + TOTAL_LEN_SIZE
                + self.payload.len(),
        );
        buf.put_u8(self.flags);
        if let Some(op) = self.mgmt_opcode {
            buf.put_u8(op);
        }
        if let Some(ack) = self.ack_num {
            buf.put_u8(ack);
        }
        if let Some(seq) = self.seq_num {
            buf.put_u8(seq);
        }
        if let Some(len) = self.total_length {
            buf.put_u16_le(len);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a [`Datagram`] from a raw byte slice.
    ///
    /// Returns `Err` for an empty buffer, nonzero reserved bits, or a field
    /// truncated by the end of the buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let hdr = r.read_u8()?;
        if hdr & flags::RESERVED_MASK != 0 {
            return Err(Error::ProtocolAbort);
        }

        let mgmt_opcode = if hdr & flags::MANAGEMENT_OPCODE != 0 {
            Some(r.read_u8()?)
        } else {
            None
        };
        let ack_num = if hdr & flags::FRAGMENT_ACK != 0 {
            Some(r.read_u8()?)
        } else {
            None
        };
        // Handshake frames are not sequenced; everything else is.
        let seq_num = if hdr & flags::HANDSHAKE == 0 {
            Some(r.read_u8()?)
        } else {
            None
        };
        let total_length = if hdr & flags::START_MESSAGE != 0 {
            Some(r.read_u16_le()?)
        } else {
            None
        };

        Ok(Self {
            flags: hdr,
            mgmt_opcode,
            ack_num,
            seq_num,
            total_length,
            payload: Bytes::copy_from_slice(r.rest()),
        })
    }

    /// `true` when this datagram begins a new message.
    pub fn is_start(&self) -> bool {
        self.flags & flags::START_MESSAGE != 0
    }

    /// `true` when this datagram continues the in-progress message.
    pub fn is_continue(&self) -> bool {
        self.flags & flags::CONTINUE_MESSAGE != 0
    }

    /// `true` when this datagram completes the in-progress message.
    pub fn is_end(&self) -> bool {
        self.flags & flags::END_MESSAGE != 0
    }
}

/// Number of header bytes a fragment will occupy on the wire.
///
/// Used by the fragmenter to size payload slices against the negotiated
/// fragment size.
pub fn fragment_header_size(first: bool, with_ack: bool) -> usize {
    let mut n = FLAGS_SIZE + SEQ_SIZE;
    if with_ack {
        n += ACK_SIZE;
    }
    if first {
        n += TOTAL_LEN_SIZE;
    }
    n
}

/// Read the sequence number of a raw frame without consuming it.
///
/// Skips the flags byte and any management-opcode / ack fields in front of
/// the sequence number.  Handshake frames carry no sequence number and
/// yield `Err`, which tells the receive path to hand them on unmodified.
pub fn peek_sequence_number(buf: &[u8]) -> Result<SequenceNumber> {
    let hdr = *buf.first().ok_or(Error::ProtocolAbort)?;
    if hdr & flags::HANDSHAKE != 0 {
        return Err(Error::ProtocolAbort);
    }
    let mut offset = FLAGS_SIZE;
    if hdr & flags::MANAGEMENT_OPCODE != 0 {
        offset += MGMT_OP_SIZE;
    }
    if hdr & flags::FRAGMENT_ACK != 0 {
        offset += ACK_SIZE;
    }
    buf.get(offset).copied().ok_or(Error::ProtocolAbort)
}

// ---------------------------------------------------------------------------
// Little-endian slice reader
// ---------------------------------------------------------------------------

/// Minimal cursor over a byte slice; every read is bounds-checked.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or(Error::ProtocolAbort)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
