//! Network Module Implementation
//!
//! This module turns a raw TCP byte stream into discrete text messages and back.
//!
//! # Components
//!
//! - `NulDelimitedCodec`: splits the stream on a single reserved delimiter byte
//! - `Connection`: owns one socket, runs its receive loop and queues inbound messages
//! - `EventBus`: delivers connection and server lifecycle events to subscribers
//!
//! # Wire format
//!
//! Every message is UTF-8 text followed by one [`DELIMITER`] byte. There is no header and
//! no length prefix, and a peer may fragment the stream arbitrarily.

pub use connection::{Connection, ConnectionId, EventHook};
pub use events::{ConnectionEvent, EventBus, ServerEvent};
pub use frame::NulDelimitedCodec;

mod connection;
mod events;
mod frame;

/// Byte terminating every message on the wire.
pub const DELIMITER: u8 = 0x00;

/// Port used by both client and server when none is given.
pub const DEFAULT_PORT: u16 = 9988;

/// Size of a single socket read in the receive loop.
pub const READ_BUFFER_SIZE: usize = 1024;
