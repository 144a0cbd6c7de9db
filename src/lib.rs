//! stonewire: null-delimited text messages over TCP.
//!
//! A [`Server`] accepts sockets and tracks every live [`Connection`] by id. A
//! [`Connection`] is also the client side: create one with [`Connection::new`] and
//! [`Connection::connect`] it. Both sides exchange UTF-8 messages terminated by a single
//! `0x00` byte, received in the order they completed on the wire.

pub mod network;
pub mod service;

pub use network::{
    Connection, ConnectionEvent, ConnectionId, NulDelimitedCodec, ServerEvent, DEFAULT_PORT,
    DELIMITER, READ_BUFFER_SIZE,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, NetworkConfig, Server, Shutdown,
    StoneWireConfig,
};
