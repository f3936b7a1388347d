//! Outbound half of the fragmentation engine.
//!
//! [`Fragmenter`] slices one whole application message at a time into
//! sequenced datagrams and tracks which sent sequence numbers the peer has
//! yet to acknowledge.
//!
//! # Protocol contract
//!
//! - One message is in progress at a time; the endpoint queues the rest.
//! - Every produced datagram consumes one sequence number, standalone acks
//!   included.
//! - Acks are cumulative: receiving ack `a` acknowledges every sequence
//!   number up to and including `a`.
//! - Sequence numbers are u8 and wrap; all interval checks go through
//!   [`crate::seq`].
//!
//! # Sequence-number layout
//!
//! ```text
//!  oldest_unacked      newest_unacked   next_seq
//!      │                     │             │
//!  ────┼─────────────────────┼─────────────┼────▶ seq space (mod 256)
//!      │ ◀── awaiting ack ──▶│
//! ```
//!
//! This module only manages state; handing datagrams to the transport is
//! the endpoint's responsibility.

use bytes::Bytes;

use crate::capabilities::MAX_FRAGMENT_SIZE;
use crate::error::{Error, Result};
use crate::packet::{self, flags, Datagram};
use crate::seq::{self, SequenceNumber};

/// Sub-state of the outbound message cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No message adopted; ready for the next one.
    Idle,
    /// A message is adopted and partially transmitted.
    InProgress,
    /// The final fragment has been handed over; awaiting release.
    Complete,
}

/// Outbound fragmentation state for one connection.
#[derive(Debug)]
pub struct Fragmenter {
    state: TxState,
    /// Message currently being sliced, if any.
    message: Option<Bytes>,
    /// Bytes of `message` already emitted.
    cursor: usize,
    /// Negotiated fragment size, datagram headers included.
    fragment_size: u16,
    /// Sequence number the next datagram will carry.
    next_seq: SequenceNumber,
    /// Oldest sent sequence number not yet acknowledged.
    oldest_unacked: SequenceNumber,
    /// Newest sent sequence number not yet acknowledged.
    newest_unacked: SequenceNumber,
    /// `true` while at least one sent sequence number awaits an ack.
    expecting_ack: bool,
}

impl Fragmenter {
    /// Create the outbound engine.
    ///
    /// The publisher's capabilities response implicitly consumes sequence
    /// number 0, so with `expect_initial_ack` the engine starts at sequence
    /// 1 with sequence 0 already awaiting acknowledgement.  The subscriber
    /// starts clean at sequence 0.
    pub fn new(expect_initial_ack: bool) -> Self {
        Self {
            state: TxState::Idle,
            message: None,
            cursor: 0,
            fragment_size: MAX_FRAGMENT_SIZE,
            next_seq: if expect_initial_ack { 1 } else { 0 },
            oldest_unacked: 0,
            newest_unacked: 0,
            expecting_ack: expect_initial_ack,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// `true` while at least one sent sequence number awaits an ack.
    pub fn expecting_ack(&self) -> bool {
        self.expecting_ack
    }

    pub fn newest_unacked_seq(&self) -> SequenceNumber {
        self.newest_unacked
    }

    pub fn oldest_unacked_seq(&self) -> SequenceNumber {
        self.oldest_unacked
    }

    pub fn next_seq(&self) -> SequenceNumber {
        self.next_seq
    }

    /// Adopt the negotiated fragment size.
    pub fn set_fragment_size(&mut self, size: u16) {
        self.fragment_size = size.min(MAX_FRAGMENT_SIZE);
    }

    pub fn fragment_size(&self) -> u16 {
        self.fragment_size
    }

    /// Consume and return the next sequence number, extending the
    /// unacked-sent range over it.
    fn assign_seq(&mut self) -> SequenceNumber {
        let s = self.next_seq;
        self.next_seq = seq::next(self.next_seq);
        self.newest_unacked = s;
        if !self.expecting_ack {
            self.oldest_unacked = s;
            self.expecting_ack = true;
        }
        s
    }

    /// Produce the next outbound datagram.
    ///
    /// With `message` set, adopts it as the new in-progress message (the
    /// engine must be [`TxState::Idle`]) and emits its first fragment; with
    /// `message` absent, emits the next fragment of the in-progress message.
    /// `piggyback_ack` inserts an ack field; resetting the local receive
    /// window is the caller's responsibility.
    pub fn prepare_fragment(
        &mut self,
        message: Option<Bytes>,
        piggyback_ack: Option<SequenceNumber>,
    ) -> Result<Bytes> {
        match (self.state, message) {
            (TxState::Idle, Some(msg)) => {
                if msg.len() > u16::MAX as usize {
                    return Err(Error::OutboundMessageTooBig);
                }
                let total = msg.len() as u16;
                let header = packet::fragment_header_size(true, piggyback_ack.is_some());
                let room = (self.fragment_size as usize).saturating_sub(header);
                let take = msg.len().min(room);

                let mut position = flags::START_MESSAGE;
                if take == msg.len() {
                    position |= flags::END_MESSAGE;
                    self.state = TxState::Complete;
                } else {
                    self.state = TxState::InProgress;
                }

                let payload = msg.slice(..take);
                self.cursor = take;
                self.message = Some(msg);

                let seq_num = self.assign_seq();
                Ok(Datagram::fragment(position, piggyback_ack, seq_num, Some(total), payload)
                    .encode())
            }
            (TxState::InProgress, None) => {
                let msg = self.message.as_ref().ok_or(Error::ProtocolAbort)?;
                let remaining = msg.len() - self.cursor;
                let header = packet::fragment_header_size(false, piggyback_ack.is_some());
                let room = (self.fragment_size as usize).saturating_sub(header);
                let take = remaining.min(room);

                let mut position = flags::CONTINUE_MESSAGE;
                if take == remaining {
                    position |= flags::END_MESSAGE;
                    self.state = TxState::Complete;
                }

                let payload = msg.slice(self.cursor..self.cursor + take);
                self.cursor += take;

                let seq_num = self.assign_seq();
                Ok(Datagram::fragment(position, piggyback_ack, seq_num, None, payload).encode())
            }
            // Adopting while busy, or continuing with nothing adopted.
            _ => Err(Error::ProtocolAbort),
        }
    }

    /// Encode a standalone ack.  Consumes a sequence number like any other
    /// datagram.
    pub fn encode_standalone_ack(&mut self, ack: SequenceNumber) -> Bytes {
        let seq_num = self.assign_seq();
        Datagram::standalone_ack(ack, seq_num).encode()
    }

    /// Release the completed message and return the engine to idle.
    ///
    /// Returns `None` unless the engine is [`TxState::Complete`].
    pub fn take_tx_packet(&mut self) -> Option<Bytes> {
        if self.state != TxState::Complete {
            return None;
        }
        self.state = TxState::Idle;
        self.cursor = 0;
        self.message.take()
    }

    /// Process a received cumulative ack.
    ///
    /// `ack` must fall inside the unacked-sent interval; anything else —
    /// including any ack while nothing is outstanding — is
    /// [`Error::InvalidAckNumber`].
    pub fn handle_ack(&mut self, ack: SequenceNumber) -> Result<()> {
        if !self.expecting_ack || !seq::in_range(ack, self.oldest_unacked, self.newest_unacked) {
            return Err(Error::InvalidAckNumber);
        }
        self.oldest_unacked = seq::next(ack);
        if ack == self.newest_unacked {
            self.expecting_ack = false;
        }
        Ok(())
    }

    /// Drop any in-progress message and reset the cursor (close path).
    pub fn clear(&mut self) {
        self.state = TxState::Idle;
        self.message = None;
        self.cursor = 0;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
