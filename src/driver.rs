//! Single-consumer event loop around an [`Endpoint`].
//!
//! The endpoint itself is a synchronous state machine that must be driven
//! from one logical thread.  This module provides that thread the tokio
//! way: a background task owns the endpoint and multiplexes application
//! commands, inbound datagrams, deferred send confirmations, and timer
//! deadlines with `tokio::select!`.  The application talks to the task
//! through a [`PaftpSession`] handle.
//!
//! ```text
//!  Application
//!      │ send(message) / recv()          PaftpSession
//!      │                                 ┌─────────────────────┐
//!      └────────────────────────────────▶│  send_tx (channel)  │
//!                                        │  recv_rx (channel)  │
//!                                        └──────────┬──────────┘
//!                                                   │ event_loop task
//!                                        ┌──────────▼──────────┐
//!                                        │ Endpoint + timers   │
//!                                        └──────────┬──────────┘
//!                                                   │ datagrams
//!                                         link_tx / link_rx (channels)
//! ```
//!
//! # Shutdown
//!
//! Drop (or close) `send_tx` to request a graceful close; the loop drains
//! queued data, waits for the final ack, and terminates.  Await
//! [`PaftpSession::close`] to collect the close reason.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::endpoint::{Endpoint, Event};
use crate::error::Error;
use crate::state::Role;
use crate::timer::{TimerConfig, TimerDriver, TimerKind};
use crate::transport::{Session, Transport};

// ---------------------------------------------------------------------------
// Timer board
// ---------------------------------------------------------------------------

/// Absolute deadlines for the five endpoint timers, shared between the
/// endpoint's [`TimerDriver`] and the event loop that sleeps on them.
type DeadlineBoard = Arc<Mutex<[Option<Instant>; 5]>>;

struct BoardTimers {
    board: DeadlineBoard,
}

impl TimerDriver for BoardTimers {
    fn start(&mut self, kind: TimerKind, after: Duration) {
        self.board.lock().unwrap()[kind.index()] = Some(Instant::now() + after);
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.board.lock().unwrap()[kind.index()] = None;
    }
}

/// Earliest armed deadline, if any.
fn next_deadline(board: &DeadlineBoard) -> Option<(TimerKind, Instant)> {
    let board = board.lock().unwrap();
    TimerKind::ALL
        .iter()
        .filter_map(|&kind| board[kind.index()].map(|at| (kind, at)))
        .min_by_key(|&(_, at)| at)
}

// ---------------------------------------------------------------------------
// Channel transport
// ---------------------------------------------------------------------------

/// Transport over an in-process datagram channel.
///
/// A channel send is complete the moment it is queued, but the endpoint
/// forbids re-entrant confirmations, so outcomes are tallied and delivered
/// by the event loop after the endpoint call returns.
struct ChannelTransport {
    link_tx: mpsc::UnboundedSender<Bytes>,
    confirms_ok: Arc<AtomicU32>,
    confirms_failed: Arc<AtomicU32>,
    available: Arc<AtomicBool>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, _session: &Session, datagram: Bytes) {
        if self.link_tx.send(datagram).is_ok() {
            self.confirms_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.confirms_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn resource_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn close_session(&mut self, session: &Session) {
        log::debug!("[paftp:loop] releasing {session}");
    }
}

// ---------------------------------------------------------------------------
// PaftpSession — application handle
// ---------------------------------------------------------------------------

/// Handle returned by [`spawn`] for concurrent send/receive.
pub struct PaftpSession {
    /// Queue a whole message for the remote peer (push [`Bytes`] into this).
    pub send_tx: mpsc::Sender<Bytes>,

    /// Whole reassembled messages from the remote peer.
    pub recv_rx: mpsc::UnboundedReceiver<Bytes>,

    connected_rx: Option<oneshot::Receiver<Result<(), Error>>>,
    handle: JoinHandle<Option<Error>>,
}

impl PaftpSession {
    /// Queue one message for delivery.
    pub async fn send(&self, data: Bytes) -> Result<(), Error> {
        // A closed channel means the event loop is gone.
        self.send_tx
            .send(data)
            .await
            .map_err(|_| Error::IncorrectState)
    }

    /// Receive the next whole message delivered by the peer.
    ///
    /// Returns `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.recv_rx.recv().await
    }

    /// Wait for the capability handshake to complete.
    pub async fn connected(&mut self) -> Result<(), Error> {
        match self.connected_rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::RemoteDisconnected)),
            // Already resolved on an earlier call.
            None => Ok(()),
        }
    }

    /// Request a graceful close and wait for the event loop to finish.
    ///
    /// Returns the close reason; `None` is a clean close.
    pub async fn close(self) -> Option<Error> {
        // Dropping send_tx signals the loop to drain and close.
        drop(self.send_tx);
        match self.handle.await {
            Ok(reason) => reason,
            Err(_) => Some(Error::IncorrectState),
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Spawn an endpoint event loop over an in-process datagram link.
///
/// `link_tx` carries outbound datagrams, `link_rx` inbound ones; wire a
/// pair of these back-to-back (or through a fault-injecting relay) to
/// connect two endpoints.  A subscriber starts its capability handshake
/// immediately.
pub fn spawn(
    role: Role,
    session: Session,
    link_tx: mpsc::UnboundedSender<Bytes>,
    link_rx: mpsc::UnboundedReceiver<Bytes>,
    config: TimerConfig,
) -> PaftpSession {
    let board: DeadlineBoard = Arc::new(Mutex::new([None; 5]));
    let confirms_ok = Arc::new(AtomicU32::new(0));
    let confirms_failed = Arc::new(AtomicU32::new(0));
    let available = Arc::new(AtomicBool::new(true));

    let transport = ChannelTransport {
        link_tx,
        confirms_ok: Arc::clone(&confirms_ok),
        confirms_failed: Arc::clone(&confirms_failed),
        available,
    };
    let timers = BoardTimers {
        board: Arc::clone(&board),
    };
    let endpoint = Endpoint::new(
        Box::new(transport),
        Box::new(timers),
        session,
        role,
        config,
    );

    let (send_tx, send_rx) = mpsc::channel::<Bytes>(64);
    let (recv_tx, recv_rx) = mpsc::unbounded_channel::<Bytes>();
    let (connected_tx, connected_rx) = oneshot::channel();

    let handle = tokio::spawn(event_loop(
        endpoint,
        board,
        confirms_ok,
        confirms_failed,
        send_rx,
        link_rx,
        recv_tx,
        connected_tx,
    ));

    PaftpSession {
        send_tx,
        recv_rx,
        connected_rx: Some(connected_rx),
        handle,
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    mut endpoint: Endpoint,
    board: DeadlineBoard,
    confirms_ok: Arc<AtomicU32>,
    confirms_failed: Arc<AtomicU32>,
    mut send_rx: mpsc::Receiver<Bytes>,
    mut link_rx: mpsc::UnboundedReceiver<Bytes>,
    recv_tx: mpsc::UnboundedSender<Bytes>,
    connected_tx: oneshot::Sender<Result<(), Error>>,
) -> Option<Error> {
    let mut connected_tx = Some(connected_tx);
    let mut close_reason = None;
    let mut app_closed = false;
    let mut link_closed = false;

    if endpoint.role() == Role::Subscriber {
        let _ = endpoint.start_connect();
    }

    loop {
        if pump(
            &mut endpoint,
            &confirms_ok,
            &confirms_failed,
            &recv_tx,
            &mut connected_tx,
            &mut close_reason,
        ) {
            break;
        }

        let deadline = next_deadline(&board);

        tokio::select! {
            // ── Branch 1: a command from the application ─────────────────
            maybe_msg = send_rx.recv(), if !app_closed => {
                match maybe_msg {
                    Some(data) => {
                        log::debug!("[paftp:loop] app queued {} bytes", data.len());
                        let _ = endpoint.send(data);
                    }
                    None => {
                        // Application dropped its handle: drain and close.
                        log::debug!("[paftp:loop] app handle dropped, closing gracefully");
                        app_closed = true;
                        endpoint.close(true);
                    }
                }
            }

            // ── Branch 2: an inbound datagram from the link ───────────────
            maybe_dg = link_rx.recv(), if !link_closed => {
                match maybe_dg {
                    Some(datagram) => {
                        let _ = endpoint.receive(datagram);
                    }
                    None => {
                        log::debug!("[paftp:loop] link dropped, aborting");
                        link_closed = true;
                        endpoint.handle_transport_disconnected();
                    }
                }
            }

            // ── Branch 3: the earliest armed endpoint timer ───────────────
            _ = tokio::time::sleep_until(deadline.map(|(_, at)| at).unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                let (kind, _) = deadline.unwrap();
                board.lock().unwrap()[kind.index()] = None;
                log::debug!("[paftp:loop] timer fired: {kind:?}");
                endpoint.handle_timeout(kind);
            }
        }
    }

    close_reason
}

/// Deliver deferred send confirmations and drain endpoint events.
///
/// Returns `true` once the endpoint has reported its terminal event.
fn pump(
    endpoint: &mut Endpoint,
    confirms_ok: &AtomicU32,
    confirms_failed: &AtomicU32,
    recv_tx: &mpsc::UnboundedSender<Bytes>,
    connected_tx: &mut Option<oneshot::Sender<Result<(), Error>>>,
    close_reason: &mut Option<Error>,
) -> bool {
    loop {
        let failed = confirms_failed.swap(0, Ordering::Relaxed);
        let ok = confirms_ok.swap(0, Ordering::Relaxed);
        for _ in 0..failed {
            let _ = endpoint.handle_send_confirmation(false);
        }
        for _ in 0..ok {
            let _ = endpoint.handle_send_confirmation(true);
        }

        let mut saw_event = false;
        while let Some(event) = endpoint.poll_event() {
            saw_event = true;
            match event {
                Event::ConnectComplete => {
                    log::info!("[paftp:loop] connected");
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Event::ConnectError(e) => {
                    log::error!("[paftp:loop] connect failed: {e}");
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(Err(e));
                    }
                    *close_reason = Some(e);
                    return true;
                }
                Event::MessageReceived(message) => {
                    if recv_tx.send(message).is_err() {
                        // Application dropped the receive side; keep the
                        // connection alive for sending.
                        log::debug!("[paftp:loop] receiver gone, message dropped");
                    }
                }
                Event::Closed(reason) => {
                    log::info!("[paftp:loop] closed: {reason:?}");
                    *close_reason = reason;
                    return true;
                }
            }
        }

        // Confirmations can enqueue events and vice versa; loop until quiet.
        if failed == 0 && ok == 0 && !saw_event {
            return false;
        }
    }
}
