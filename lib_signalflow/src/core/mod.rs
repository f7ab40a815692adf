//! # Core Engine Module
//!
//! The transport-facing half of the SignalFlow client. These components move
//! frames between the socket and the computations; they know nothing about
//! what a computation does with its messages.
//!
//! ## Core Components:
//!
//! - **`connection`**: owns the single WebSocket, reconnects on failure and is
//!   the only writer on the socket.
//! - **`dispatcher`**: decodes every inbound frame and routes it to the channel
//!   it names. It is the one ordering point of the client.
//! - **`channel`**: the per-computation delivery queue that sits between the
//!   dispatcher and a computation's watch loop.
//! - **`registry`**: the name → channel map, plus the per-client sequence that
//!   generates channel names.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Per-computation delivery queue.
pub mod channel;
/// The reconnecting WebSocket owner.
pub mod connection;
/// Inbound frame decoding and routing.
pub mod dispatcher;
/// Channel registry and name generation.
pub mod registry;

// --- Public API Re-exports ---
pub use channel::{Channel, CloseReason};
pub use connection::{ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionHooks, ConnectionManager, Frame};
pub use dispatcher::Dispatcher;
pub use registry::{ChannelSequence, Registry};
