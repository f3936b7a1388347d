//! Per-connection endpoint state machine.
//!
//! An [`Endpoint`] owns the complete state for one logical connection over
//! the datagram transport.  Its responsibilities are:
//! - Driving the lifecycle FSM (see [`crate::state`]).
//! - Running the open-time capability handshake.
//! - Coordinating [`crate::fragmenter`] and [`crate::reassembler`].
//! - Sliding-window accounting and the acknowledgement policy.
//! - Reordering out-of-order datagrams through a tiny fixed buffer.
//! - Retransmitting the retained last datagram on ack timeout.
//!
//! # Entry points
//!
//! Everything is synchronous and single-threaded: the five entry points —
//! [`Endpoint::send`], [`Endpoint::receive`],
//! [`Endpoint::handle_send_confirmation`], [`Endpoint::handle_timeout`],
//! [`Endpoint::close`] — must be called from one logical thread.  Progress
//! notifications surface through [`Endpoint::poll_event`]; callers drain it
//! after every entry call.  The [`crate::driver`] module provides a tokio
//! event loop that funnels all of this for multi-threaded hosts.
//!
//! # Send serialisation
//!
//! At most one datagram is ever outstanding at the transport: every send
//! sets the `OpInFlight` flag and nothing else is sent until the
//! confirmation clears it.  `drive_sending` is the single serialisation
//! point for transmit and consults the remote receive window, the pending
//! standalone ack, and the fragmenter sub-state, in that priority order.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::capabilities::{
    self, CapabilitiesRequest, CapabilitiesResponse, DEFAULT_MTU, MAX_FRAGMENT_SIZE,
    MAX_RECEIVE_WINDOW, MAX_VERSION, MIN_VERSION, VERSION_NONE,
};
use crate::error::{Error, Result};
use crate::fragmenter::{Fragmenter, TxState};
use crate::packet::{self, flags, Datagram};
use crate::reassembler::{Reassembler, RxState};
use crate::seq::{self, SequenceNumber};
use crate::state::{ConnFlag, ConnFlags, EndpointState, Role};
use crate::timer::{TimerConfig, TimerDriver, TimerFlags, TimerKind};
use crate::transport::{Session, Transport};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of out-of-order datagrams held while waiting for a gap to fill.
/// Anything further out is treated as a duplicate or retransmission.
pub const REORDER_SIZE: usize = 4;

/// When the local receive window shrinks to this many slots, a standalone
/// ack is sent immediately instead of waiting for the send-ack timer.
pub const IMMEDIATE_ACK_THRESHOLD: u8 = 1;

/// Data fragments are only sent without a piggybacked ack while the remote
/// window is above this threshold.
pub const NO_ACK_SEND_THRESHOLD: u8 = 1;

/// How many times the retained last datagram is retransmitted before the
/// connection is declared dead.
pub const MAX_RETRANSMIT: u8 = 3;

/// Largest message the wire format can describe (the declared total-length
/// field is 16 bits).
pub const MAX_MESSAGE_LENGTH: usize = u16::MAX as usize;

/// Close-behaviour bits, combined and passed down the close path.
mod close_flags {
    /// Drop in-flight data instead of draining it.
    pub const ABORT: u8 = 0b01;
    /// Do not surface a close notification.
    pub const SUPPRESS_EVENT: u8 = 0b10;
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress notification surfaced to the layer above.
///
/// Exactly one of [`Event::Closed`] / [`Event::ConnectError`] is emitted per
/// endpoint lifetime, and nothing is emitted after it.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The capability handshake completed; data may now flow.
    ConnectComplete,
    /// The connection failed before the handshake completed.
    ConnectError(Error),
    /// A whole reassembled message, ownership transferred to the caller.
    MessageReceived(Bytes),
    /// The connection is gone; `None` means a clean application close.
    Closed(Option<Error>),
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One logical connection over a datagram transport.
pub struct Endpoint {
    role: Role,
    state: EndpointState,
    session: Session,
    transport: Box<dyn Transport>,
    timers: Box<dyn TimerDriver>,
    config: TimerConfig,

    /// Outbound fragmentation engine.
    tx: Fragmenter,
    /// Inbound reassembly engine.
    rx: Reassembler,

    /// Receive-window slots we have left before the peer must pause.
    local_rx_window: u8,
    /// Receive-window slots we believe the peer has left.
    remote_rx_window: u8,
    /// Negotiated window size both counters reset to.
    rx_window_max: u8,

    /// Whole outbound messages not yet adopted by the fragmenter.
    send_queue: VecDeque<Bytes>,
    /// A standalone ack is owed and should be sent at the next opportunity.
    standalone_ack_pending: bool,
    /// Retained copy of the most recently transmitted datagram.
    last_tx_datagram: Option<Bytes>,
    /// Retransmission attempts since the last acknowledged datagram.
    retransmit_count: u8,
    /// Consecutive "transport busy" reports.
    resource_wait_count: u32,

    /// Out-of-order datagrams indexed by distance from the next expected
    /// sequence number.
    reorder_slots: [Option<Bytes>; REORDER_SIZE],
    reorder_occupied: u8,

    timer_flags: TimerFlags,
    conn_flags: ConnFlags,

    /// Notifications awaiting collection via [`Endpoint::poll_event`].
    events: VecDeque<Event>,
    /// The handshake completed at some point (selects the close event kind).
    connected_once: bool,
    /// A close notification has been emitted.
    close_notified: bool,
}

impl Endpoint {
    /// Initialise an endpoint over `transport` for `session`.
    ///
    /// A publisher expects the subscriber's first ack to cover the
    /// capabilities response it will send, so its engines start with
    /// sequence number 0 already spoken for.
    pub fn new(
        transport: Box<dyn Transport>,
        timers: Box<dyn TimerDriver>,
        session: Session,
        role: Role,
        config: TimerConfig,
    ) -> Self {
        let expect_initial_ack = role == Role::Publisher;
        Self {
            role,
            state: EndpointState::Ready,
            session,
            transport,
            timers,
            config,
            tx: Fragmenter::new(expect_initial_ack),
            rx: Reassembler::new(!expect_initial_ack),
            local_rx_window: 0,
            remote_rx_window: 0,
            rx_window_max: 0,
            send_queue: VecDeque::new(),
            standalone_ack_pending: false,
            last_tx_datagram: None,
            retransmit_count: 0,
            resource_wait_count: 0,
            reorder_slots: Default::default(),
            reorder_occupied: 0,
            timer_flags: TimerFlags::default(),
            conn_flags: ConnFlags::default(),
            events: VecDeque::new(),
            connected_once: false,
            close_notified: false,
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_receive_window(&self) -> u8 {
        self.local_rx_window
    }

    pub fn remote_receive_window(&self) -> u8 {
        self.remote_rx_window
    }

    pub fn receive_window_max(&self) -> u8 {
        self.rx_window_max
    }

    pub fn retransmit_count(&self) -> u8 {
        self.retransmit_count
    }

    /// Oldest sent sequence number still awaiting acknowledgement.
    pub fn oldest_unacked_tx_seq(&self) -> SequenceNumber {
        self.tx.oldest_unacked_seq()
    }

    /// `true` while at least one sent datagram awaits acknowledgement.
    pub fn expecting_ack(&self) -> bool {
        self.tx.expecting_ack()
    }

    /// Number of datagrams parked in the reorder buffer.
    pub fn reorder_occupied(&self) -> usize {
        self.reorder_occupied as usize
    }

    /// Collect the next pending notification, oldest first.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Begin the capability handshake (subscriber only).
    ///
    /// Sends the capabilities request and arms the connect timer.  Any
    /// failure aborts the endpoint before returning.
    pub fn start_connect(&mut self) -> Result<()> {
        let result = self.start_connect_inner();
        if let Err(e) = result {
            self.stop_connect_timer();
            self.do_close(close_flags::ABORT, Some(e));
        }
        result
    }

    fn start_connect_inner(&mut self) -> Result<()> {
        if self.role != Role::Subscriber || self.state != EndpointState::Ready {
            return Err(Error::IncorrectState);
        }
        self.state = EndpointState::Connecting;

        let request = CapabilitiesRequest::local().encode();

        // Canceled when the response arrives or the endpoint dies.
        self.start_connect_timer();

        self.send_write(request.clone());
        // Stash the request at the head of the send queue, which carries no
        // data this early, purely to keep it alive until the send
        // confirmation releases it.
        self.queue_tx(request);
        Ok(())
    }

    /// Queue one whole message for delivery.
    ///
    /// The message is fragmented lazily as window and transport allow.  Any
    /// failure aborts the endpoint before returning.
    pub fn send(&mut self, data: Bytes) -> Result<()> {
        let result = self.send_inner(data);
        if let Err(e) = result {
            self.do_close(close_flags::ABORT, Some(e));
        }
        result
    }

    fn send_inner(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if !self.state.is_connected() {
            return Err(Error::IncorrectState);
        }
        if data.len() > MAX_MESSAGE_LENGTH {
            return Err(Error::OutboundMessageTooBig);
        }
        self.queue_tx(data);
        self.drive_sending()
    }

    /// Hand one received datagram to the endpoint.
    ///
    /// Out-of-order datagrams within [`REORDER_SIZE`] of the next expected
    /// sequence number are parked until the gap fills; anything further out
    /// is treated as a duplicate.  Protocol errors close the endpoint.
    pub fn receive(&mut self, data: Bytes) -> Result<()> {
        if self.state == EndpointState::Closed {
            return Err(Error::IncorrectState);
        }

        let expected = self.rx.next_expected_seq();
        let seq_num = match packet::peek_sequence_number(&data) {
            Ok(s) => s,
            // No sequence number (handshake frame) — hand it on unmodified.
            Err(_) => return self.rx_packet_process(data),
        };
        log::debug!("[paftp] <== rx seq={seq_num}, expected={expected}");

        if seq_num == expected && self.reorder_occupied == 0 {
            return self.rx_packet_process(data);
        }

        let offset = seq::diff(seq_num, expected) as usize;
        if offset >= REORDER_SIZE {
            // Too far out to be a reorder: an old or retransmitted
            // datagram.  The reassembler rejects it and the rejection is
            // swallowed.
            log::debug!("[paftp] rx seq={seq_num} beyond reorder window, processing directly");
            return self.rx_packet_process(data);
        }
        if self.reorder_slots[offset].is_some() {
            log::debug!("[paftp] reorder slot {offset} already occupied, processing directly");
            return self.rx_packet_process(data);
        }

        log::debug!("[paftp] parking rx seq={seq_num} at reorder offset {offset}");
        self.reorder_slots[offset] = Some(data);
        self.reorder_occupied += 1;

        if self.reorder_slots[0].is_none() {
            log::debug!(
                "[paftp] reorder hole remains, {} parked",
                self.reorder_occupied
            );
            return Ok(());
        }

        // The gap is filled: drain the consecutive prefix, then slide any
        // survivors forward by the drained length.
        let mut result = Ok(());
        let mut drained = 0;
        while drained < REORDER_SIZE {
            match self.reorder_slots[drained].take() {
                Some(parked) => {
                    self.reorder_occupied -= 1;
                    result = self.rx_packet_process(parked);
                    drained += 1;
                }
                None => break,
            }
        }
        for idx in drained..REORDER_SIZE {
            if let Some(parked) = self.reorder_slots[idx].take() {
                self.reorder_slots[idx - drained] = Some(parked);
            }
        }
        result
    }

    /// Report the outcome of the most recent transport send.
    ///
    /// Clears the in-flight gate; the first confirmation of a connection is
    /// the capabilities buffer's, which is released rather than treated as
    /// a fragment confirmation.
    pub fn handle_send_confirmation(&mut self, ok: bool) -> Result<()> {
        if self.state == EndpointState::Closed {
            // A confirmation can trail the close that retired the endpoint.
            return Ok(());
        }
        self.conn_flags.clear(ConnFlag::OpInFlight);
        log::debug!(
            "[paftp] send confirmation ok={ok}, handshake={}",
            !self.conn_flags.has(ConnFlag::CapabilitiesConfReceived)
        );

        if !self.conn_flags.has(ConnFlag::CapabilitiesConfReceived) {
            self.conn_flags.set(ConnFlag::CapabilitiesConfReceived);
            return self.handle_handshake_confirmation();
        }
        self.handle_fragment_confirmation(ok)
    }

    /// One of the endpoint's timers fired.
    ///
    /// Fires whose flag has already been cleared are stale and ignored.
    pub fn handle_timeout(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Connect => {
                if self.timer_flags.take(TimerKind::Connect) {
                    log::error!("[paftp] connect handshake timed out");
                    self.do_close(close_flags::ABORT, Some(Error::ConnectTimedOut));
                }
            }
            TimerKind::AckReceived => {
                if self.timer_flags.take(TimerKind::AckReceived) {
                    self.on_ack_received_timeout();
                }
            }
            TimerKind::SendAck => {
                if self.timer_flags.take(TimerKind::SendAck)
                    && !self.conn_flags.has(ConnFlag::StandaloneAckInFlight)
                {
                    if let Err(e) = self.drive_standalone_ack() {
                        self.do_close(close_flags::ABORT, Some(e));
                    }
                }
            }
            TimerKind::WaitResource => {
                if self.timer_flags.take(TimerKind::WaitResource) {
                    if let Err(e) = self.drive_sending() {
                        self.do_close(close_flags::ABORT, Some(e));
                    }
                }
            }
            TimerKind::Retransmit => {
                if self.timer_flags.take(TimerKind::Retransmit) {
                    self.on_retransmit_timeout();
                }
            }
        }
    }

    /// Close the connection.
    ///
    /// `graceful` drains queued and unacked data first; an abort drops
    /// in-flight data and reports [`Error::AppClosedConnection`].  Either
    /// way exactly one close notification fires.
    pub fn close(&mut self, graceful: bool) {
        if self.state == EndpointState::Closed {
            return;
        }
        if graceful {
            self.do_close(0, None);
        } else {
            self.do_close(close_flags::ABORT, Some(Error::AppClosedConnection));
        }
    }

    /// The lower layer lost the peer: abort with [`Error::RemoteDisconnected`].
    pub fn handle_transport_disconnected(&mut self) {
        self.do_close(close_flags::ABORT, Some(Error::RemoteDisconnected));
    }

    // -----------------------------------------------------------------------
    // Transmit path
    // -----------------------------------------------------------------------

    /// Append a buffer to the send queue.
    fn queue_tx(&mut self, data: Bytes) {
        log::debug!("[paftp] queueing {} bytes for tx", data.len());
        self.send_queue.push_back(data);
    }

    /// Hand one datagram to the transport and retain it for retransmission.
    fn send_write(&mut self, datagram: Bytes) {
        self.conn_flags.set(ConnFlag::OpInFlight);
        self.retransmit_count = 0;
        self.last_tx_datagram = Some(datagram.clone());
        if let Ok(sn) = packet::peek_sequence_number(&datagram) {
            log::debug!(
                "[paftp] ==> tx [sn, ack] = [{sn:3}, {:?}]",
                peek_ack_num(&datagram)
            );
        }
        self.transport.send(&self.session, datagram);
    }

    /// Send one sequenced datagram, shrinking the remote window by one.
    fn send_characteristic(&mut self, datagram: Bytes) {
        self.send_write(datagram);
        self.remote_rx_window = self.remote_rx_window.saturating_sub(1);
        log::debug!(
            "[paftp] decremented remote rx window, new size = {}",
            self.remote_rx_window
        );
    }

    /// The single serialisation point for transmit.
    ///
    /// Returns without sending while the remote window is exhausted, an
    /// operation is in flight, or the transport is out of resources;
    /// otherwise sends the highest-priority pending datagram.
    fn drive_sending(&mut self) -> Result<()> {
        let window_nearly_closed = self.remote_rx_window <= NO_ACK_SEND_THRESHOLD
            && !self.timer_flags.has(TimerKind::SendAck)
            && !self.standalone_ack_pending;
        if window_nearly_closed {
            log::debug!("[paftp] no send: remote window nearly closed and no ack to send");
        }
        if self.remote_rx_window == 0 {
            log::debug!("[paftp] no send: remote window closed");
        }
        if self.conn_flags.has(ConnFlag::OpInFlight) {
            log::debug!("[paftp] no send: operation in flight");
        }
        if window_nearly_closed
            || self.remote_rx_window == 0
            || self.conn_flags.has(ConnFlag::OpInFlight)
        {
            return Ok(());
        }

        if !self.transport.resource_available() {
            // Transport is busy; retry when the wait-resource timer fires.
            self.start_wait_resource_timer();
            return Ok(());
        }
        self.resource_wait_count = 0;

        if self.standalone_ack_pending && !self.conn_flags.has(ConnFlag::StandaloneAckInFlight) {
            log::debug!("[paftp] sending pending standalone ack");
            self.do_send_standalone_ack();
            return Ok(());
        }

        match self.tx.state() {
            TxState::Idle => {
                if let Some(message) = self.send_queue.pop_front() {
                    self.send_message_fragment(Some(message))?;
                } else {
                    log::debug!("[paftp] no pending packets, nothing to send");
                }
            }
            TxState::InProgress => {
                self.send_message_fragment(None)?;
            }
            TxState::Complete => {
                // Release the finished message before looking for more work.
                let _finished = self.tx.take_tx_packet();
                if let Some(message) = self.send_queue.pop_front() {
                    self.send_message_fragment(Some(message))?;
                } else if self.state == EndpointState::Closing && !self.tx.expecting_ack() {
                    log::debug!("[paftp] closing and nothing left unacked, finalizing");
                    self.finalize_close_now(None);
                } else {
                    log::debug!("[paftp] no more packets to send");
                }
            }
        }
        Ok(())
    }

    /// Produce and transmit the next fragment, piggybacking an ack when the
    /// send-ack timer says one is owed.
    fn send_message_fragment(&mut self, message: Option<Bytes>) -> Result<()> {
        let piggyback_ack = if self.timer_flags.has(TimerKind::SendAck) {
            self.local_rx_window = self.rx_window_max;
            log::debug!(
                "[paftp] reset local rx window on piggyback ack, size = {}",
                self.local_rx_window
            );
            Some(self.rx.newest_unacked_seq())
        } else {
            None
        };

        let datagram = self.tx.prepare_fragment(message, piggyback_ack)?;
        self.send_characteristic(datagram);

        if piggyback_ack.is_some() {
            self.rx.mark_acked();
            self.stop_send_ack_timer();
        }
        self.start_ack_received_timer();
        Ok(())
    }

    /// Note that a standalone ack is owed and try to send it now.
    fn drive_standalone_ack(&mut self) -> Result<()> {
        self.stop_send_ack_timer();
        self.standalone_ack_pending = true;
        self.drive_sending()
    }

    /// Encode and transmit the pending standalone ack.
    fn do_send_standalone_ack(&mut self) {
        let ack = self.rx.newest_unacked_seq();
        log::debug!("[paftp] sending standalone ack = {ack}");
        let datagram = self.tx.encode_standalone_ack(ack);
        self.send_characteristic(datagram);

        self.local_rx_window = self.rx_window_max;
        self.rx.mark_acked();
        self.conn_flags.set(ConnFlag::StandaloneAckInFlight);
        self.start_ack_received_timer();
    }

    // -----------------------------------------------------------------------
    // Send confirmations
    // -----------------------------------------------------------------------

    /// First confirmation of the connection: the capabilities buffer's.
    fn handle_handshake_confirmation(&mut self) -> Result<()> {
        // Release the stashed capabilities request/response payload.
        self.send_queue.pop_front();
        if self.state == EndpointState::Aborting {
            // Version negotiation failed; the response is out, so tear down.
            self.do_close(close_flags::ABORT, Some(Error::IncompatibleVersions));
        }
        Ok(())
    }

    fn handle_fragment_confirmation(&mut self, ok: bool) -> Result<()> {
        let result = self.fragment_confirmation_inner(ok);
        if let Err(e) = result {
            self.do_close(close_flags::ABORT, Some(e));
        }
        result
    }

    fn fragment_confirmation_inner(&mut self, ok: bool) -> Result<()> {
        if !self.state.is_connected() {
            return Err(Error::IncorrectState);
        }

        if self.conn_flags.has(ConnFlag::StandaloneAckInFlight) {
            // The confirmed datagram was the standalone ack; it is no
            // longer owed.
            self.standalone_ack_pending = false;
            self.conn_flags.clear(ConnFlag::StandaloneAckInFlight);
        }

        self.stop_retransmit_timer();

        if !ok {
            log::error!("[paftp] transport failed to send datagram");
            self.stop_ack_received_timer();
            return Err(Error::SendingBlocked);
        }

        // The local window may have shrunk between transmission and
        // confirmation; send the immediate ack now if it did and no
        // outbound fragment is about to carry it.
        if self.local_rx_window <= IMMEDIATE_ACK_THRESHOLD
            && self.send_queue.is_empty()
            && self.tx.state() != TxState::InProgress
        {
            self.drive_standalone_ack()
        } else {
            self.drive_sending()
        }
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Process one in-order (or dedup-bound) datagram.
    fn rx_packet_process(&mut self, data: Bytes) -> Result<()> {
        if self.state == EndpointState::Closed {
            return Err(Error::IncorrectState);
        }
        let result = self.rx_packet_inner(data);
        if let Err(e) = result {
            log::error!("[paftp] rx processing error: {e}");
            self.do_close(close_flags::ABORT, Some(e));
        }
        result
    }

    fn rx_packet_inner(&mut self, data: Bytes) -> Result<()> {
        // The first inbound datagram of a connection is the peer's half of
        // the capability handshake; it never reaches the reassembler.
        if !self.conn_flags.has(ConnFlag::CapabilitiesMsgReceived) {
            return self.handle_first_packet(data);
        }

        let first = *data.first().ok_or(Error::ProtocolAbort)?;
        if first & flags::HANDSHAKE != 0 {
            log::debug!("[paftp] unexpected handshake datagram, dropping");
            return Ok(());
        }

        let dg = Datagram::decode(&data)?;

        // Sequence validation comes first: a duplicate that slipped past
        // the reorder buffer is dropped whole, including a piggybacked ack
        // that is stale by the time the retransmission lands.
        match self.rx.accept(&dg) {
            Ok(()) => {}
            Err(Error::InvalidSequenceNumber) => {
                log::debug!("[paftp] ignoring duplicate datagram");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // The fragment was accepted, so one receive-window slot is gone.
        self.local_rx_window = self.local_rx_window.wrapping_sub(1);
        log::debug!(
            "[paftp] decremented local rx window, new size = {}",
            self.local_rx_window
        );

        if let Some(ack) = dg.ack_num {
            self.tx.handle_ack(ack)?;
            self.retransmit_count = 0;

            if !self.tx.expecting_ack() {
                // Everything sent is acknowledged.
                self.stop_ack_received_timer();
                self.stop_retransmit_timer();
                self.last_tx_datagram = None;

                if self.state == EndpointState::Closing
                    && self.send_queue.is_empty()
                    && self.tx.state() == TxState::Idle
                {
                    self.finalize_close_now(None);
                    return Ok(());
                }
            } else {
                // Acks are still owed for newer fragments.
                self.restart_ack_received_timer()?;
                self.stop_retransmit_timer();
                self.start_retransmit_timer();
            }

            self.remote_rx_window =
                adjust_remote_window(ack, self.rx_window_max, self.tx.newest_unacked_seq());
            log::debug!(
                "[paftp] ack {ack} opened remote rx window to {}",
                self.remote_rx_window
            );

            // Transmission may have been paused on window exhaustion.
            self.drive_sending()?;
            if self.state == EndpointState::Closed {
                // drive_sending finalized a deferred close.
                return Ok(());
            }
        }

        if self.rx.has_unacked_data() {
            if self.local_rx_window <= IMMEDIATE_ACK_THRESHOLD
                && !self.conn_flags.has(ConnFlag::OpInFlight)
            {
                // Window nearly shut and nothing outbound to piggyback on:
                // reopen it for the sender right away.
                self.drive_standalone_ack()?;
            } else {
                self.start_send_ack_timer();
            }
        }

        if self.rx.state() == RxState::Complete {
            if let Some(message) = self.rx.take_rx_packet() {
                log::debug!("[paftp] reassembled whole message, len = {}", message.len());
                if self.state != EndpointState::Closing {
                    self.events.push_back(Event::MessageReceived(message));
                }
            }
        }
        Ok(())
    }

    fn handle_first_packet(&mut self, data: Bytes) -> Result<()> {
        match self.role {
            Role::Subscriber => {
                if self.state != EndpointState::Connecting {
                    return Err(Error::IncorrectState);
                }
                self.conn_flags.set(ConnFlag::CapabilitiesMsgReceived);
                self.handle_capabilities_response(data)
            }
            Role::Publisher => {
                if self.state != EndpointState::Ready {
                    return Err(Error::IncorrectState);
                }
                self.conn_flags.set(ConnFlag::CapabilitiesMsgReceived);
                self.handle_capabilities_request(data)
            }
        }
    }

    /// Publisher side: answer the subscriber's capabilities request.
    fn handle_capabilities_request(&mut self, data: Bytes) -> Result<()> {
        self.state = EndpointState::Connecting;

        let req = match CapabilitiesRequest::decode(&data) {
            Ok(req) => req,
            Err(e) => {
                // A garbled opening write: drop the connection quietly and
                // let the subscriber's connect attempt time out.
                self.do_close(close_flags::ABORT | close_flags::SUPPRESS_EVENT, Some(e));
                return Err(e);
            }
        };

        let mtu = if req.mtu > 0 { req.mtu } else { DEFAULT_MTU };
        let fragment_size = mtu.min(MAX_FRAGMENT_SIZE);
        let window = req.window_size.min(MAX_RECEIVE_WINDOW);
        self.remote_rx_window = window;
        self.local_rx_window = window;
        self.rx_window_max = window;

        let selected = capabilities::select_version(&req);
        log::info!(
            "[paftp] selected protocol version {selected}, fragment size {fragment_size}, window {window}"
        );

        let response = CapabilitiesResponse {
            selected_version: selected,
            fragment_size,
            window_size: window,
        };

        if selected == VERSION_NONE {
            log::error!(
                "[paftp] incompatible protocol versions; supported range is {MIN_VERSION}..={MAX_VERSION}"
            );
            self.state = EndpointState::Aborting;
        } else {
            self.tx.set_fragment_size(fragment_size);
            self.rx.set_fragment_size(fragment_size);
            log::info!(
                "[paftp] using fragment sizes rx {} / tx {}",
                self.rx.fragment_size(),
                self.tx.fragment_size()
            );
        }

        let buf = response.encode();
        self.send_write(buf.clone());
        // Keep the response alive until the send confirmation; the close on
        // the incompatible-versions path waits for it too.
        self.queue_tx(buf);

        if self.state == EndpointState::Aborting {
            return Ok(());
        }
        self.handle_connect_complete();
        Ok(())
    }

    /// Subscriber side: adopt the publisher's capabilities response.
    fn handle_capabilities_response(&mut self, data: Bytes) -> Result<()> {
        let resp = CapabilitiesResponse::decode(&data)?;
        if resp.fragment_size == 0 {
            return Err(Error::InvalidFragmentSize);
        }

        log::info!(
            "[paftp] publisher chose version {}; supported range is {MIN_VERSION}..={MAX_VERSION}",
            resp.selected_version
        );
        if resp.selected_version < MIN_VERSION || resp.selected_version > MAX_VERSION {
            return Err(Error::IncompatibleVersions);
        }

        let fragment_size = resp.fragment_size.min(MAX_FRAGMENT_SIZE);
        self.tx.set_fragment_size(fragment_size);
        self.rx.set_fragment_size(fragment_size);
        log::info!(
            "[paftp] using fragment sizes rx {} / tx {}",
            self.rx.fragment_size(),
            self.tx.fragment_size()
        );

        self.remote_rx_window = resp.window_size;
        self.local_rx_window = resp.window_size;
        self.rx_window_max = resp.window_size;

        // The response itself consumed one slot and requires an ack.
        self.local_rx_window = self.local_rx_window.wrapping_sub(1);
        log::debug!(
            "[paftp] decremented local rx window for handshake, size = {}",
            self.local_rx_window
        );
        self.start_send_ack_timer();

        self.handle_connect_complete();
        Ok(())
    }

    fn handle_connect_complete(&mut self) {
        self.state = EndpointState::Connected;
        self.stop_connect_timer();
        self.connected_once = true;
        self.events.push_back(Event::ConnectComplete);
    }

    // -----------------------------------------------------------------------
    // Retransmission
    // -----------------------------------------------------------------------

    fn on_ack_received_timeout(&mut self) {
        log::warn!(
            "[paftp] ack timeout, retransmissions so far: {}/{}",
            self.retransmit_count,
            MAX_RETRANSMIT
        );
        if self.retransmit_count >= MAX_RETRANSMIT {
            log::error!("[paftp] no ack after {MAX_RETRANSMIT} retransmissions, closing");
            self.do_close(close_flags::ABORT, Some(Error::FragmentAckTimedOut));
            return;
        }
        match self.retransmit_last_packet() {
            Ok(()) => self.start_ack_received_timer(),
            Err(e) => self.do_close(close_flags::ABORT, Some(e)),
        }
    }

    fn on_retransmit_timeout(&mut self) {
        if self.retransmit_count >= MAX_RETRANSMIT {
            log::error!("[paftp] max retransmission attempts reached, closing");
            self.do_close(
                close_flags::ABORT,
                Some(Error::MaxRetransmitAttemptsReached),
            );
            return;
        }
        match self.retransmit_last_packet() {
            Ok(()) => self.start_retransmit_timer(),
            Err(e) => self.do_close(close_flags::ABORT, Some(e)),
        }
    }

    /// Re-hand the retained last datagram to the transport.
    fn retransmit_last_packet(&mut self) -> Result<()> {
        let datagram = self
            .last_tx_datagram
            .clone()
            .ok_or(Error::FragmentAckTimedOut)?;
        self.retransmit_count += 1;
        log::warn!(
            "[paftp] retransmitting last datagram ({} bytes), attempt {}/{}",
            datagram.len(),
            self.retransmit_count,
            MAX_RETRANSMIT
        );
        self.conn_flags.set(ConnFlag::OpInFlight);
        self.transport.send(&self.session, datagram);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    fn do_close(&mut self, flags: u8, err: Option<Error>) {
        let old_state = self.state;
        let abort = flags & close_flags::ABORT != 0;

        let closable = (old_state != EndpointState::Closed && old_state != EndpointState::Closing)
            || (old_state == EndpointState::Closing && abort);
        if !closable {
            return;
        }

        if self.role == Role::Subscriber {
            self.stop_connect_timer();
        }

        for slot in self.reorder_slots.iter_mut() {
            *slot = None;
        }
        self.reorder_occupied = 0;

        // A graceful close drains queued messages and waits out the unacked
        // range; anything not yet connected has nothing to drain.
        let draining_needed = self.state.is_connected()
            && (self.tx.state() != TxState::Idle
                || !self.send_queue.is_empty()
                || self.tx.expecting_ack());
        if abort || !draining_needed {
            self.finalize_close(flags, err);
        } else {
            // drive_sending and the ack path finalize once everything is
            // sent and acknowledged.
            log::debug!("[paftp] deferring close until tx drains");
            self.state = EndpointState::Closing;
        }
    }

    /// Finalize from the drain path with default flags.
    fn finalize_close_now(&mut self, err: Option<Error>) {
        self.finalize_close(0, err);
    }

    fn finalize_close(&mut self, flags: u8, err: Option<Error>) {
        self.state = EndpointState::Closed;
        self.send_queue.clear();

        log::info!("[paftp] shutting down {}", self.session);
        let session = std::mem::take(&mut self.session);
        self.transport.close_session(&session);

        if flags & close_flags::SUPPRESS_EVENT == 0 {
            self.emit_close_event(err);
        }

        self.stop_ack_received_timer();
        self.stop_send_ack_timer();
        self.stop_wait_resource_timer();
        self.stop_retransmit_timer();

        // Latch the in-flight gate so nothing goes out after close.
        self.conn_flags.set(ConnFlag::OpInFlight);

        self.last_tx_datagram = None;
        self.retransmit_count = 0;
        self.standalone_ack_pending = false;
        self.tx.clear();
        self.rx.clear();
    }

    /// Surface the terminal notification, once per endpoint lifetime.
    fn emit_close_event(&mut self, err: Option<Error>) {
        if self.close_notified {
            return;
        }
        self.close_notified = true;
        match err {
            Some(e) if !self.connected_once => self.events.push_back(Event::ConnectError(e)),
            other => self.events.push_back(Event::Closed(other)),
        }
    }

    // -----------------------------------------------------------------------
    // Timer helpers
    // -----------------------------------------------------------------------

    fn start_connect_timer(&mut self) {
        self.timers
            .start(TimerKind::Connect, self.config.connect_timeout);
        self.timer_flags.set(TimerKind::Connect);
    }

    fn stop_connect_timer(&mut self) {
        self.timers.cancel(TimerKind::Connect);
        self.timer_flags.clear(TimerKind::Connect);
    }

    fn start_ack_received_timer(&mut self) {
        if !self.timer_flags.has(TimerKind::AckReceived) {
            log::debug!("[paftp] starting ack-received timer");
            self.timers
                .start(TimerKind::AckReceived, self.config.ack_received_timeout);
            self.timer_flags.set(TimerKind::AckReceived);
        }
    }

    fn restart_ack_received_timer(&mut self) -> Result<()> {
        if !self.timer_flags.has(TimerKind::AckReceived) {
            return Err(Error::IncorrectState);
        }
        self.stop_ack_received_timer();
        self.start_ack_received_timer();
        Ok(())
    }

    fn stop_ack_received_timer(&mut self) {
        self.timers.cancel(TimerKind::AckReceived);
        self.timer_flags.clear(TimerKind::AckReceived);
    }

    fn start_send_ack_timer(&mut self) {
        if !self.timer_flags.has(TimerKind::SendAck) {
            log::debug!("[paftp] starting send-ack timer");
            self.timers
                .start(TimerKind::SendAck, self.config.send_ack_timeout);
            self.timer_flags.set(TimerKind::SendAck);
        }
    }

    fn stop_send_ack_timer(&mut self) {
        self.timers.cancel(TimerKind::SendAck);
        self.timer_flags.clear(TimerKind::SendAck);
    }

    fn start_wait_resource_timer(&mut self) {
        self.resource_wait_count += 1;
        if self.resource_wait_count >= self.config.max_resource_blocks {
            log::error!("[paftp] transport resources unavailable for too long, closing");
            self.resource_wait_count = 0;
            self.do_close(close_flags::ABORT, Some(Error::NotConnected));
            return;
        }
        if !self.timer_flags.has(TimerKind::WaitResource) {
            log::debug!("[paftp] starting wait-resource timer");
            self.timers
                .start(TimerKind::WaitResource, self.config.wait_resource_timeout);
            self.timer_flags.set(TimerKind::WaitResource);
        }
    }

    fn stop_wait_resource_timer(&mut self) {
        self.timers.cancel(TimerKind::WaitResource);
        self.timer_flags.clear(TimerKind::WaitResource);
    }

    fn start_retransmit_timer(&mut self) {
        if !self.timer_flags.has(TimerKind::Retransmit) {
            log::debug!("[paftp] starting retransmit timer");
            self.timers
                .start(TimerKind::Retransmit, self.config.retransmit_timeout);
            self.timer_flags.set(TimerKind::Retransmit);
        }
    }

    fn stop_retransmit_timer(&mut self) {
        self.timers.cancel(TimerKind::Retransmit);
        self.timer_flags.clear(TimerKind::Retransmit);
    }
}

// ---------------------------------------------------------------------------
// Window arithmetic
// ---------------------------------------------------------------------------

/// Open slots in the remote receive window after `received_ack`.
///
/// The window boundary sits `max_window` past the acknowledged sequence
/// number; the slots left are the boundary minus the newest sequence number
/// already sent, all in mod-256 space.
fn adjust_remote_window(
    received_ack: SequenceNumber,
    max_window: u8,
    newest_unacked: SequenceNumber,
) -> u8 {
    max_window.wrapping_sub(seq::diff(newest_unacked, received_ack))
}

/// Read the ack field of a raw frame, if it carries one.
fn peek_ack_num(buf: &[u8]) -> Option<SequenceNumber> {
    let hdr = *buf.first()?;
    if hdr & flags::HANDSHAKE != 0 || hdr & flags::FRAGMENT_ACK == 0 {
        return None;
    }
    let mut offset = packet::FLAGS_SIZE;
    if hdr & flags::MANAGEMENT_OPCODE != 0 {
        offset += packet::MGMT_OP_SIZE;
    }
    buf.get(offset).copied()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_window_fully_open_when_all_acked() {
        // Ack equals newest unacked: every slot is open again.
        assert_eq!(adjust_remote_window(7, 4, 7), 4);
    }

    #[test]
    fn remote_window_partial() {
        // Newest sent is two past the ack: two slots consumed.
        assert_eq!(adjust_remote_window(5, 4, 7), 2);
    }

    #[test]
    fn remote_window_across_wrap() {
        // ack = 254, newest = 1: three outstanding beyond the ack.
        assert_eq!(adjust_remote_window(254, 4, 1), 1);
    }

    #[test]
    fn peek_ack_reads_past_mgmt_opcode() {
        let with_ack = [flags::FRAGMENT_ACK, 42, 0];
        assert_eq!(peek_ack_num(&with_ack), Some(42));

        let with_op = [flags::FRAGMENT_ACK | flags::MANAGEMENT_OPCODE, 9, 42, 0];
        assert_eq!(peek_ack_num(&with_op), Some(42));

        let without = [flags::CONTINUE_MESSAGE, 0];
        assert_eq!(peek_ack_num(&without), None);
    }
}
