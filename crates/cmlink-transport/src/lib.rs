//! # cmlink Transport
//!
//! Carrier layer for cmlink connections.
//!
//! This crate provides:
//! - The [`Connection`] contract and its [`ConnectionEvent`] stream
//! - Framed TCP ([`TcpConnection`])
//! - Reliable-sequenced UDP ([`UdpConnection`])
//! - Binary WebSocket messages over TLS ([`WebSocketConnection`])
//! - [`Endpoint`] and the [`ProtocolTypes`] bit set
//!
//! Every carrier runs one worker thread per session. Callers never block on
//! the network: `connect`, `send` and `disconnect` return immediately and
//! results arrive as events.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod tcp;
pub mod udp;
pub mod websocket;

pub(crate) mod worker;

pub use connection::{Connection, ConnectionEvent, DEFAULT_CONNECT_TIMEOUT};
pub use endpoint::{Endpoint, ProtocolTypes};
pub use error::{FrameError, PacketError, TransportError, TransportResult};
pub use tcp::TcpConnection;
pub use udp::{UdpConfig, UdpConnection};
pub use websocket::{WebSocketConnection, WebSocketOptions};
