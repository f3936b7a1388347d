//! Error taxonomy for the transport.
//!
//! Two propagation regimes apply (see [`crate::endpoint`]):
//! - Errors from `send` / `start_connect` are returned to the caller *and*
//!   abort the connection before returning.
//! - Errors raised while handling a received datagram or a timer fire have
//!   no caller to return to; they close the endpoint and surface through
//!   the close notification.
//!
//! A duplicate or out-of-window receive is deliberately *not* an error at
//! the connection level: the receive path swallows
//! [`Error::InvalidSequenceNumber`] after reorder-buffer dedup so benign
//! retransmissions do not tear the connection down.

use thiserror::Error;

/// Everything that can go wrong inside the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// A buffer allocation was refused.
    #[error("out of memory")]
    NoMemory,

    /// An argument failed validation (empty message, bad session, ...).
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation is not legal in the endpoint's current state.
    #[error("incorrect state")]
    IncorrectState,

    /// The outbound message exceeds what the wire format can describe.
    #[error("outbound message too big")]
    OutboundMessageTooBig,

    /// The peer advertised a zero or otherwise unusable fragment size.
    #[error("invalid fragment size")]
    InvalidFragmentSize,

    /// No protocol version is supported by both peers.
    #[error("incompatible protocol versions")]
    IncompatibleVersions,

    /// A datagram arrived with a sequence number other than the next
    /// expected one.  Swallowed after dedup; fatal otherwise.
    #[error("invalid sequence number")]
    InvalidSequenceNumber,

    /// An acknowledgement number fell outside the unacked-sent range.
    #[error("invalid ack number")]
    InvalidAckNumber,

    /// The peer violated the protocol in a way that has no finer code.
    #[error("protocol abort")]
    ProtocolAbort,

    /// The capability handshake did not complete in time.
    #[error("connect timed out")]
    ConnectTimedOut,

    /// No acknowledgement arrived for a sent fragment in time.
    #[error("fragment ack timed out")]
    FragmentAckTimedOut,

    /// Every retransmission attempt of the last datagram went unanswered.
    #[error("max retransmit attempts reached")]
    MaxRetransmitAttemptsReached,

    /// The transport reported a send failure.
    #[error("sending blocked")]
    SendingBlocked,

    /// The lower layer lost the peer.
    #[error("remote device disconnected")]
    RemoteDisconnected,

    /// The application closed the connection.
    #[error("application closed connection")]
    AppClosedConnection,

    /// The handshake completed but no connect-complete consumer exists.
    #[error("no connect complete callback")]
    NoConnectCompleteCallback,

    /// The transport stayed resource-exhausted for too long.
    #[error("not connected")]
    NotConnected,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
