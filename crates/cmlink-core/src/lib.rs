//! # cmlink Core
//!
//! Envelope encryption for CM connections.
//!
//! A freshly connected TCP or UDP carrier is not yet usable: the server first
//! sends a `ChannelEncryptRequest`, the client answers with an RSA-wrapped
//! session key, and the server confirms with a `ChannelEncryptResult`. From
//! then on every payload is AES-encrypted. [`EnvelopeEncryptedConnection`]
//! performs that exchange on behalf of the consumer and exposes the same
//! [`Connection`](cmlink_transport::Connection) contract as the carrier it wraps.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encryption;
pub mod error;
pub mod msg;

pub use encryption::{Action, EncryptionState, EnvelopeConfig, EnvelopeEncryptedConnection, Handshake};
pub use error::{Error, HandshakeError, Result};
pub use msg::{EMsg, MsgHdr, Universe};
