//! The carrier-independent connection contract.
//!
//! Every carrier (TCP, UDP, WebSocket) and the envelope encryption decorator
//! implement [`Connection`]. A connection is single-session: calling
//! [`Connection::connect`] while a session is active first tears the old one
//! down. Progress is reported through an event channel rather than return
//! values, because connecting, receiving and faulting all happen on the
//! carrier's worker thread.

use crossbeam_channel::Receiver;
use std::net::IpAddr;
use std::time::Duration;

use crate::endpoint::{Endpoint, ProtocolTypes};

/// Connect timeout used when the caller has no preference
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Lifecycle and data events raised by a connection
///
/// Per connect attempt, `Connected` fires at most once, `Disconnected` fires
/// exactly once, and no `NetMsgReceived` follows `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The session is established and payloads may be sent
    Connected,
    /// The session ended
    Disconnected {
        /// Whether the local side asked for the disconnect
        user_initiated: bool,
    },
    /// One complete inbound payload
    NetMsgReceived(Vec<u8>),
}

/// A message-oriented connection to a single CM server
pub trait Connection: Send + Sync {
    /// Begin connecting to `endpoint`.
    ///
    /// Returns immediately. The outcome arrives on the event channel: either
    /// [`ConnectionEvent::Connected`], or a single
    /// [`ConnectionEvent::Disconnected`] with `user_initiated == false` if the
    /// attempt fails or exceeds `timeout`.
    fn connect(&self, endpoint: &Endpoint, timeout: Duration);

    /// Tear down the active session.
    ///
    /// Raises `Disconnected` carrying `user_initiated` exactly once. Safe to
    /// call from any thread; never waits for the worker to exit.
    fn disconnect(&self, user_initiated: bool);

    /// Queue a payload for delivery. Dropped silently when not connected.
    fn send(&self, data: Vec<u8>);

    /// Receiving end of this connection's event stream.
    ///
    /// All clones share one queue; each event is delivered to one receiver.
    fn events(&self) -> Receiver<ConnectionEvent>;

    /// Endpoint of the active session, if any
    fn current_endpoint(&self) -> Option<Endpoint>;

    /// Local address the active session is bound to
    fn local_ip(&self) -> Option<IpAddr>;

    /// Carrier this connection speaks
    fn protocol_types(&self) -> ProtocolTypes;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) {
        (**self).connect(endpoint, timeout);
    }

    fn disconnect(&self, user_initiated: bool) {
        (**self).disconnect(user_initiated);
    }

    fn send(&self, data: Vec<u8>) {
        (**self).send(data);
    }

    fn events(&self) -> Receiver<ConnectionEvent> {
        (**self).events()
    }

    fn current_endpoint(&self) -> Option<Endpoint> {
        (**self).current_endpoint()
    }

    fn local_ip(&self) -> Option<IpAddr> {
        (**self).local_ip()
    }

    fn protocol_types(&self) -> ProtocolTypes {
        (**self).protocol_types()
    }
}
