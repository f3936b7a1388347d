//! `paftp` — a reliable, connection-oriented message transport over
//! datagram-style service-discovery frames.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │ send(message) / poll_event()
//!      ▼
//!  ┌───────────────────────────────────────┐
//!  │              Endpoint                 │
//!  │  (lifecycle FSM, sliding window,      │
//!  │   ack policy, reorder buffer,         │
//!  │   retransmission)                     │
//!  │    ├── Fragmenter  (outbound slices)  │
//!  │    └── Reassembler (inbound rebuild)  │
//!  └────┬──────────────────────┬───────────┘
//!       │ encoded datagrams    │ arm / cancel
//!  ┌────▼──────┐         ┌─────▼──────┐
//!  │ Transport │         │ TimerDriver│
//!  │  (trait)  │         │  (trait)   │
//!  └───────────┘         └────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]       — wire format (serialise / deserialise)
//! - [`capabilities`] — open-time version/MTU/window handshake messages
//! - [`fragmenter`]   — outbound message slicing and unacked-seq tracking
//! - [`reassembler`]  — in-order inbound reassembly
//! - [`endpoint`]     — per-connection lifecycle and flow control
//! - [`error`]        — error taxonomy shared by every layer
//! - [`seq`]          — modulo-256 sequence-number arithmetic
//! - [`state`]        — finite-state-machine types and connection flags
//! - [`timer`]        — timer kinds, timeouts, and the scheduler interface
//! - [`transport`]    — datagram transport abstraction
//! - [`driver`]       — tokio event loop funnelling all entry points
//!
//! The endpoint itself is a plain synchronous state machine: every call
//! returns promptly, and asynchrony is expressed by arming a timer or
//! issuing a transport send whose confirmation arrives later.  The
//! [`driver`] module wraps an endpoint in a single tokio task so that
//! sends, receives, confirmations, and timer fires are serialised the way
//! the protocol requires.

pub mod capabilities;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod fragmenter;
pub mod packet;
pub mod reassembler;
pub mod seq;
pub mod state;
pub mod timer;
pub mod transport;

pub use endpoint::{Endpoint, Event};
pub use error::{Error, Result};
pub use transport::{Session, Transport};
