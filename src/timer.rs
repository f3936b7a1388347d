//! Timer kinds, timeout configuration, and the scheduler interface.
//!
//! The endpoint never sleeps: every deadline is expressed by asking a
//! [`TimerDriver`] to arm a one-shot timer, and the runtime re-enters the
//! endpoint through [`crate::endpoint::Endpoint::handle_timeout`] when it
//! fires.  Timers are idempotent to cancel.  Because a fire may already be
//! queued when the endpoint cancels, the endpoint keeps its own
//! [`TimerFlags`] bitset and ignores fires whose flag has been cleared —
//! the event-race guard.

use std::time::Duration;

/// The five one-shot timers an endpoint runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Bounds the capability handshake (subscriber only).
    Connect,
    /// Fires when a sent fragment has gone unacknowledged too long.
    AckReceived,
    /// Fires when received fragments have gone unacknowledged too long.
    SendAck,
    /// Fires to retry sending after the transport reported "busy".
    WaitResource,
    /// Drives retransmission of the retained last datagram.
    Retransmit,
}

impl TimerKind {
    /// All kinds, in [`TimerKind::index`] order.
    pub const ALL: [TimerKind; 5] = [
        TimerKind::Connect,
        TimerKind::AckReceived,
        TimerKind::SendAck,
        TimerKind::WaitResource,
        TimerKind::Retransmit,
    ];

    /// Stable dense index, usable for per-timer arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Connect => 0,
            Self::AckReceived => 1,
            Self::SendAck => 2,
            Self::WaitResource => 3,
            Self::Retransmit => 4,
        }
    }
}

/// Adjustable timeout parameters.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// How long the subscriber waits for the capabilities response.
    pub connect_timeout: Duration,
    /// How long a sent fragment may go unacknowledged before the endpoint
    /// retransmits.  Kept short enough to leave room for every
    /// retransmission attempt within the peer's patience.
    pub ack_received_timeout: Duration,
    /// Interval between retransmission attempts of the last datagram.
    pub retransmit_timeout: Duration,
    /// How long received fragments may go unacknowledged before a
    /// standalone ack is pushed out.
    pub send_ack_timeout: Duration,
    /// Pause before retrying when the transport reports "busy".
    pub wait_resource_timeout: Duration,
    /// How many consecutive busy reports are tolerated before the
    /// connection is dropped.
    pub max_resource_blocks: u32,
}

/// Base ack-timeout budget the resource-block cap is derived from.
const ACK_TIMEOUT_MS: u64 = 15_000;
/// Wait-resource retry period.
const WAIT_RES_TIMEOUT_MS: u64 = 1_000;

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            ack_received_timeout: Duration::from_millis(2_000),
            retransmit_timeout: Duration::from_millis(2_000),
            send_ack_timeout: Duration::from_millis(2_500),
            wait_resource_timeout: Duration::from_millis(WAIT_RES_TIMEOUT_MS),
            max_resource_blocks: (ACK_TIMEOUT_MS / WAIT_RES_TIMEOUT_MS) as u32,
        }
    }
}

/// Scheduler interface the endpoint arms its deadlines through.
///
/// Implementations must deliver at most one fire per `start`, on the same
/// logical thread that drives the endpoint, by calling
/// [`crate::endpoint::Endpoint::handle_timeout`] with the kind.  Starting a
/// timer that is already armed resets it; cancelling an idle timer is a
/// no-op.
pub trait TimerDriver: Send {
    /// Arm (or re-arm) the one-shot timer `kind` to fire after `after`.
    fn start(&mut self, kind: TimerKind, after: Duration);

    /// Cancel `kind` if armed.
    fn cancel(&mut self, kind: TimerKind);
}

// ---------------------------------------------------------------------------
// Timer flags
// ---------------------------------------------------------------------------

/// Bitset recording which timers the endpoint believes are running.
///
/// A fire is acted upon only if its flag is still set, and the flag is
/// cleared before acting.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerFlags(u8);

impl TimerFlags {
    pub fn has(self, kind: TimerKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn set(&mut self, kind: TimerKind) {
        self.0 |= 1 << kind.index();
    }

    pub fn clear(&mut self, kind: TimerKind) {
        self.0 &= !(1 << kind.index());
    }

    /// Clear `kind` and report whether it was set — the fire-time race guard.
    pub fn take(&mut self, kind: TimerKind) -> bool {
        let was = self.has(kind);
        self.clear(kind);
        was
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_stable() {
        for (i, kind) in TimerKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn take_clears_and_reports() {
        let mut f = TimerFlags::default();
        f.set(TimerKind::SendAck);
        assert!(f.take(TimerKind::SendAck));
        assert!(!f.take(TimerKind::SendAck));
        assert!(!f.take(TimerKind::Connect));
    }

    #[test]
    fn default_config_derives_resource_cap() {
        let cfg = TimerConfig::default();
        assert_eq!(cfg.max_resource_blocks, 15);
        assert_eq!(cfg.retransmit_timeout, Duration::from_millis(2_000));
    }
}
