//! Inbound half of the fragmentation engine.
//!
//! [`Reassembler`] accepts strictly in-order datagrams, rebuilds the
//! application message they carry, and remembers which received sequence
//! numbers still need acknowledging.
//!
//! # Protocol contract
//!
//! - Only the exact next expected sequence number is accepted; anything
//!   else is [`Error::InvalidSequenceNumber`] and the caller decides
//!   whether that is a duplicate to swallow or a protocol violation.
//! - A message opens with a start fragment declaring its total length, an
//!   upper bound the accumulated payload may never exceed.
//! - Every accepted datagram — standalone acks included — consumes one
//!   receive-window slot and becomes data we owe an acknowledgement for.
//!
//! This module only manages state; window accounting and ack scheduling
//! are the endpoint's responsibility.

use bytes::{BufMut, Bytes, BytesMut};

use crate::capabilities::MAX_FRAGMENT_SIZE;
use crate::error::{Error, Result};
use crate::packet::Datagram;
use crate::seq::{self, SequenceNumber};

/// Sub-state of the inbound message cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// No message under reassembly.
    Idle,
    /// A start fragment has arrived; more payload expected.
    InProgress,
    /// The end fragment has arrived; the message awaits collection.
    Complete,
}

/// Inbound reassembly state for one connection.
#[derive(Debug)]
pub struct Reassembler {
    state: RxState,
    /// Payload accumulated so far.
    buffer: BytesMut,
    /// Total length declared by the start fragment.
    expected_len: usize,
    /// Negotiated fragment size, datagram headers included.
    fragment_size: u16,
    /// Sequence number the next datagram must carry.
    next_expected: SequenceNumber,
    /// Newest accepted sequence number not yet acknowledged to the peer.
    newest_unacked: SequenceNumber,
    /// `true` while at least one accepted datagram awaits our ack.
    unacked_data: bool,
}

impl Reassembler {
    /// Create the inbound engine.
    ///
    /// On the subscriber the capabilities response implicitly consumed
    /// receive sequence number 0, so with `initial_ack_pending` the engine
    /// starts expecting sequence 1 and already owes the peer an ack for 0.
    /// The publisher starts clean, expecting sequence 0.
    pub fn new(initial_ack_pending: bool) -> Self {
        Self {
            state: RxState::Idle,
            buffer: BytesMut::new(),
            expected_len: 0,
            fragment_size: MAX_FRAGMENT_SIZE,
            next_expected: if initial_ack_pending { 1 } else { 0 },
            newest_unacked: 0,
            unacked_data: initial_ack_pending,
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn next_expected_seq(&self) -> SequenceNumber {
        self.next_expected
    }

    /// Sequence number to place in the next outbound ack field.
    pub fn newest_unacked_seq(&self) -> SequenceNumber {
        self.newest_unacked
    }

    /// `true` while at least one accepted datagram awaits our ack.
    pub fn has_unacked_data(&self) -> bool {
        self.unacked_data
    }

    /// Record that an ack covering everything received so far went out.
    pub fn mark_acked(&mut self) {
        self.unacked_data = false;
    }

    /// Adopt the negotiated fragment size.
    pub fn set_fragment_size(&mut self, size: u16) {
        self.fragment_size = size.min(MAX_FRAGMENT_SIZE);
    }

    pub fn fragment_size(&self) -> u16 {
        self.fragment_size
    }

    /// Accept one decoded datagram.
    ///
    /// On success the next expected sequence number advances and the
    /// datagram's sequence number becomes the newest owed an ack.  The
    /// payload, if any, is appended to the in-progress message.
    pub fn accept(&mut self, dg: &Datagram) -> Result<()> {
        let seq_num = dg.seq_num.ok_or(Error::ProtocolAbort)?;
        if seq_num != self.next_expected {
            return Err(Error::InvalidSequenceNumber);
        }

        if dg.is_start() {
            if self.state != RxState::Idle {
                return Err(Error::ProtocolAbort);
            }
            let total = dg.total_length.ok_or(Error::ProtocolAbort)? as usize;
            if dg.payload.len() > total {
                return Err(Error::ProtocolAbort);
            }
            self.expected_len = total;
            self.buffer = BytesMut::with_capacity(total);
            self.buffer.put_slice(&dg.payload);
            self.state = if dg.is_end() {
                RxState::Complete
            } else {
                RxState::InProgress
            };
        } else if dg.is_continue() || dg.is_end() {
            if self.state != RxState::InProgress {
                return Err(Error::ProtocolAbort);
            }
            if self.buffer.len() + dg.payload.len() > self.expected_len {
                return Err(Error::ProtocolAbort);
            }
            self.buffer.put_slice(&dg.payload);
            if dg.is_end() {
                self.state = RxState::Complete;
            }
        } else if !dg.payload.is_empty() {
            // A datagram with no position flags must be payload-less
            // (standalone ack).
            return Err(Error::ProtocolAbort);
        }

        self.next_expected = seq::next(self.next_expected);
        self.newest_unacked = seq_num;
        self.unacked_data = true;
        Ok(())
    }

    /// Hand over the reassembled message and return to idle.
    ///
    /// Returns `None` unless the engine is [`RxState::Complete`].
    pub fn take_rx_packet(&mut self) -> Option<Bytes> {
        if self.state != RxState::Complete {
            return None;
        }
        self.state = RxState::Idle;
        self.expected_len = 0;
        Some(std::mem::take(&mut self.buffer).freeze())
    }

    /// Drop any partially reassembled message (close path).
    pub fn clear(&mut self) {
        self.state = RxState::Idle;
        self.buffer = BytesMut::new();
        self.expected_len = 0;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    fn fragment(
        position: u8,
        seq_num: SequenceNumber,
        total: Option<u16>,
        payload: &'static [u8],
    ) -> Datagram {
        Datagram::fragment(position, None, seq_num, total, Bytes::from_static(payload))
    }

    #[test]
    fn initial_state_publisher() {
        let r = Reassembler::new(false);
        assert_eq!(r.next_expected_seq(), 0);
        assert!(!r.has_unacked_data());
    }

    #[test]
    fn initial_state_subscriber_owes_handshake_ack() {
        let r = Reassembler::new(true);
        assert_eq!(r.next_expected_seq(), 1);
        assert_eq!(r.newest_unacked_seq(), 0);
        assert!(r.has_unacked_data());
    }

    #[test]
    fn single_fragment_message_completes() {
        let mut r = Reassembler::new(false);
        let dg = fragment(
            flags::START_MESSAGE | flags::END_MESSAGE,
            0,
            Some(5),
            b"hello",
        );
        r.accept(&dg).unwrap();
        assert_eq!(r.state(), RxState::Complete);
        assert_eq!(&r.take_rx_packet().unwrap()[..], b"hello");
        assert_eq!(r.state(), RxState::Idle);
        assert_eq!(r.next_expected_seq(), 1);
        assert!(r.has_unacked_data());
    }

    #[test]
    fn three_fragments_reassemble_in_order() {
        let mut r = Reassembler::new(false);
        r.accept(&fragment(flags::START_MESSAGE, 0, Some(9), b"abc"))
            .unwrap();
        assert_eq!(r.state(), RxState::InProgress);
        r.accept(&fragment(flags::CONTINUE_MESSAGE, 1, None, b"def"))
            .unwrap();
        r.accept(&fragment(
            flags::CONTINUE_MESSAGE | flags::END_MESSAGE,
            2,
            None,
            b"ghi",
        ))
        .unwrap();
        assert_eq!(&r.take_rx_packet().unwrap()[..], b"abcdefghi");
        assert_eq!(r.newest_unacked_seq(), 2);
    }

    #[test]
    fn wrong_sequence_number_rejected_without_side_effects() {
        let mut r = Reassembler::new(false);
        let dg = fragment(flags::START_MESSAGE | flags::END_MESSAGE, 3, Some(1), b"x");
        assert_eq!(r.accept(&dg), Err(Error::InvalidSequenceNumber));
        assert_eq!(r.next_expected_seq(), 0);
        assert!(!r.has_unacked_data());
    }

    #[test]
    fn second_start_while_in_progress_rejected() {
        let mut r = Reassembler::new(false);
        r.accept(&fragment(flags::START_MESSAGE, 0, Some(10), b"abc"))
            .unwrap();
        let dg = fragment(flags::START_MESSAGE, 1, Some(4), b"x");
        assert_eq!(r.accept(&dg), Err(Error::ProtocolAbort));
    }

    #[test]
    fn continue_without_start_rejected() {
        let mut r = Reassembler::new(false);
        let dg = fragment(flags::CONTINUE_MESSAGE, 0, None, b"x");
        assert_eq!(r.accept(&dg), Err(Error::ProtocolAbort));
    }

    #[test]
    fn payload_beyond_declared_length_rejected() {
        let mut r = Reassembler::new(false);
        r.accept(&fragment(flags::START_MESSAGE, 0, Some(4), b"abc"))
            .unwrap();
        let dg = fragment(flags::CONTINUE_MESSAGE | flags::END_MESSAGE, 1, None, b"de");
        assert_eq!(r.accept(&dg), Err(Error::ProtocolAbort));
    }

    #[test]
    fn standalone_ack_consumes_receive_slot() {
        let mut r = Reassembler::new(false);
        let dg = Datagram::standalone_ack(7, 0);
        r.accept(&dg).unwrap();
        assert_eq!(r.next_expected_seq(), 1);
        assert_eq!(r.newest_unacked_seq(), 0);
        assert!(r.has_unacked_data());
        assert_eq!(r.state(), RxState::Idle);
    }

    #[test]
    fn mark_acked_clears_debt() {
        let mut r = Reassembler::new(false);
        r.accept(&Datagram::standalone_ack(0, 0)).unwrap();
        assert!(r.has_unacked_data());
        r.mark_acked();
        assert!(!r.has_unacked_data());
    }

    #[test]
    fn sequence_wraps_past_255() {
        let mut r = Reassembler::new(false);
        for i in 0..=255u16 {
            r.accept(&Datagram::standalone_ack(0, i as u8)).unwrap();
        }
        assert_eq!(r.next_expected_seq(), 0);
    }
}
