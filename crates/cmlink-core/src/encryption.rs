//! Envelope encryption over any [`Connection`].
//!
//! [`Handshake`] is the socket-free state machine:
//!
//! ```text
//! Disconnected --inner Connected--> Connected --EncryptRequest--> Challenged
//!      ^                                                              |
//!      +------------- inner Disconnected / fault           EncryptResult OK
//!                                                                     v
//!                                                                 Encrypted
//! ```
//!
//! [`EnvelopeEncryptedConnection`] wraps a carrier, feeds its events through a
//! [`Handshake`] on a pump thread and re-emits only what the consumer should
//! see: `Connected` once the channel is encrypted, decrypted payloads, and
//! every `Disconnected` unchanged.

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use cmlink_crypto::{
    CryptoError, FilterKind, MIN_CHALLENGE_SIZE, ServerPublicKey, SessionFilter, SessionKey,
    blob_checksum,
};
use cmlink_transport::{Connection, ConnectionEvent, Endpoint, ProtocolTypes};

use crate::error::{Error, HandshakeError, Result};
use crate::msg::{
    ChannelEncryptRequest, ChannelEncryptResponse, ChannelEncryptResult, EMsg,
    ENCRYPTED_KEY_SIZE, MsgHdr, PROTOCOL_VERSION, Universe,
};

/// Settings for the channel handshake
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Universe the server must report
    pub universe: Universe,
    /// Key used to wrap the session key
    pub public_key: ServerPublicKey,
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    /// No inner session
    Disconnected,
    /// Inner session up, waiting for the encryption request
    Connected,
    /// Response sent, waiting for the result
    Challenged,
    /// Channel encrypted; payloads flow
    Encrypted,
}

/// What the decorator must do after an inbound payload
#[derive(Debug)]
pub enum Action {
    /// Send this handshake message on the inner connection
    Reply(Vec<u8>),
    /// Channel is encrypted; tell the consumer it is connected
    Established,
    /// Hand this plaintext to the consumer
    Deliver(Vec<u8>),
    /// Fatal; tear the inner connection down
    Disconnect(Error),
    /// Nothing to do
    Ignore,
}

/// Channel handshake and payload filter for one connection
#[derive(Debug)]
pub struct Handshake {
    config: EnvelopeConfig,
    state: EncryptionState,
    filter: Option<SessionFilter>,
}

impl Handshake {
    /// New handshake in the `Disconnected` state
    #[must_use]
    pub fn new(config: EnvelopeConfig) -> Self {
        Self {
            config,
            state: EncryptionState::Disconnected,
            filter: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> EncryptionState {
        self.state
    }

    /// Filter variant negotiated so far
    #[must_use]
    pub fn filter_kind(&self) -> Option<FilterKind> {
        self.filter.as_ref().map(SessionFilter::kind)
    }

    /// Inner connection came up
    pub fn on_connected(&mut self) {
        self.state = EncryptionState::Connected;
        self.filter = None;
    }

    /// Inner connection went away; key material is dropped
    pub fn on_disconnected(&mut self) {
        self.state = EncryptionState::Disconnected;
        self.filter = None;
    }

    /// Process one inbound payload
    pub fn on_message(&mut self, data: &[u8]) -> Action {
        match self.state {
            EncryptionState::Encrypted => {
                return match self.decrypt(data) {
                    Ok(plaintext) => Action::Deliver(plaintext),
                    Err(e) => self.fail(e),
                };
            }
            EncryptionState::Disconnected => {
                debug!("rejected {} byte payload while disconnected", data.len());
                return Action::Ignore;
            }
            EncryptionState::Connected | EncryptionState::Challenged => {}
        }

        let hdr = match MsgHdr::decode(data) {
            Ok((hdr, _)) => hdr,
            Err(e) => {
                debug!("failed to parse message during channel setup");
                return self.fail(e);
            }
        };

        match (self.state, hdr.msg_type()) {
            (EncryptionState::Connected, Some(EMsg::ChannelEncryptRequest)) => {
                match self.handle_request(data) {
                    Ok(reply) => Action::Reply(reply),
                    Err(e) => self.fail(e),
                }
            }
            (EncryptionState::Challenged, Some(EMsg::ChannelEncryptResult)) => {
                match self.handle_result(data) {
                    Ok(()) => Action::Established,
                    Err(e) => self.fail(e),
                }
            }
            (state, _) => {
                debug!("rejected EMsg {} during channel setup ({:?})", hdr.emsg, state);
                Action::Ignore
            }
        }
    }

    /// Encrypt an outbound payload; `None` until the channel is encrypted
    ///
    /// # Errors
    ///
    /// Returns an error if the filter fails to encrypt.
    pub fn encrypt(&self, plaintext: &[u8]) -> std::result::Result<Option<Vec<u8>>, CryptoError> {
        match (&self.filter, self.state) {
            (Some(filter), EncryptionState::Encrypted) => filter.encrypt(plaintext).map(Some),
            _ => Ok(None),
        }
    }

    fn decrypt(&self, ciphertext: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        match &self.filter {
            Some(filter) => filter.decrypt(ciphertext),
            None => Err(CryptoError::DecryptionFailed),
        }
    }

    fn handle_request(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let request = ChannelEncryptRequest::decode(data)?;
        debug!(
            "got encryption request: universe {} protocol version {}",
            request.universe, request.protocol_version
        );

        if request.protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::ProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: request.protocol_version,
            }
            .into());
        }
        if request.universe != self.config.universe.raw() {
            return Err(HandshakeError::UniverseMismatch {
                expected: self.config.universe,
                actual: request.universe,
            }
            .into());
        }

        let challenge = (request.challenge.len() >= MIN_CHALLENGE_SIZE)
            .then_some(request.challenge.as_slice());
        if challenge.is_none() && !request.challenge.is_empty() {
            debug!(
                "ignoring {} byte challenge, shorter than {}",
                request.challenge.len(),
                MIN_CHALLENGE_SIZE
            );
        }

        let key = SessionKey::generate()?;
        let encrypted_key = self.config.public_key.encrypt(&key.blob(challenge))?;
        let response = ChannelEncryptResponse {
            protocol_version: PROTOCOL_VERSION,
            key_size: ENCRYPTED_KEY_SIZE,
            key_crc: blob_checksum(&encrypted_key),
            encrypted_key,
        };

        self.filter = Some(key.into_filter(challenge.is_some()));
        self.state = EncryptionState::Challenged;
        Ok(response.encode())
    }

    fn handle_result(&mut self, data: &[u8]) -> Result<()> {
        let result = ChannelEncryptResult::decode(data)?;
        debug!("encryption result: {}", result.result);

        if !result.is_ok() || self.filter.is_none() {
            return Err(HandshakeError::Rejected(result.result).into());
        }
        self.state = EncryptionState::Encrypted;
        Ok(())
    }

    fn fail(&mut self, err: impl Into<Error>) -> Action {
        self.state = EncryptionState::Disconnected;
        self.filter = None;
        Action::Disconnect(err.into())
    }
}

fn lock(handshake: &Mutex<Handshake>) -> MutexGuard<'_, Handshake> {
    handshake.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection decorator that encrypts everything after a channel handshake
///
/// The decorator consumes the inner connection's event stream; read events
/// from [`Connection::events`] on the decorator only.
pub struct EnvelopeEncryptedConnection<C: Connection + 'static> {
    inner: Arc<C>,
    handshake: Arc<Mutex<Handshake>>,
    events_rx: Receiver<ConnectionEvent>,
    // Dropping the sender stops the pump
    _shutdown: Sender<()>,
}

impl<C: Connection + 'static> EnvelopeEncryptedConnection<C> {
    /// Wrap `inner` and start the event pump
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the pump thread cannot be spawned.
    pub fn new(inner: C, config: EnvelopeConfig) -> Result<Self> {
        let inner = Arc::new(inner);
        let handshake = Arc::new(Mutex::new(Handshake::new(config)));
        let (events_tx, events_rx) = unbounded();
        let (shutdown, shutdown_rx) = unbounded();

        let pump = Pump {
            inner: inner.clone(),
            handshake: handshake.clone(),
            inner_events: inner.events(),
            events_tx,
        };
        thread::Builder::new()
            .name("cmlink-envelope".to_string())
            .spawn(move || pump.run(&shutdown_rx))?;

        Ok(Self {
            inner,
            handshake,
            events_rx,
            _shutdown: shutdown,
        })
    }

    /// Wrapped connection
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Handshake progress
    #[must_use]
    pub fn state(&self) -> EncryptionState {
        lock(&self.handshake).state()
    }

    /// Filter variant negotiated for the current session
    #[must_use]
    pub fn filter_kind(&self) -> Option<FilterKind> {
        lock(&self.handshake).filter_kind()
    }
}

impl<C: Connection + 'static> Connection for EnvelopeEncryptedConnection<C> {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) {
        self.inner.connect(endpoint, timeout);
    }

    fn disconnect(&self, user_initiated: bool) {
        self.inner.disconnect(user_initiated);
    }

    fn send(&self, data: Vec<u8>) {
        let sealed = lock(&self.handshake).encrypt(&data);
        match sealed {
            Ok(Some(ciphertext)) => self.inner.send(ciphertext),
            Ok(None) => debug!("dropping {} byte payload, channel not encrypted", data.len()),
            Err(e) => warn!("failed to encrypt outgoing payload: {}", e),
        }
    }

    fn events(&self) -> Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }

    fn current_endpoint(&self) -> Option<Endpoint> {
        self.inner.current_endpoint()
    }

    fn local_ip(&self) -> Option<IpAddr> {
        self.inner.local_ip()
    }

    fn protocol_types(&self) -> ProtocolTypes {
        self.inner.protocol_types()
    }
}

struct Pump<C: Connection> {
    inner: Arc<C>,
    handshake: Arc<Mutex<Handshake>>,
    inner_events: Receiver<ConnectionEvent>,
    events_tx: Sender<ConnectionEvent>,
}

impl<C: Connection> Pump<C> {
    fn run(&self, shutdown: &Receiver<()>) {
        loop {
            select! {
                recv(self.inner_events) -> event => match event {
                    Ok(event) => self.handle(event),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        debug!("envelope event pump stopped");
    }

    fn handle(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                debug!("inner connection up, awaiting encryption request");
                lock(&self.handshake).on_connected();
            }
            ConnectionEvent::Disconnected { user_initiated } => {
                lock(&self.handshake).on_disconnected();
                let _ = self
                    .events_tx
                    .send(ConnectionEvent::Disconnected { user_initiated });
            }
            ConnectionEvent::NetMsgReceived(data) => {
                let action = lock(&self.handshake).on_message(&data);
                match action {
                    Action::Reply(reply) => self.inner.send(reply),
                    Action::Established => {
                        info!("channel encrypted");
                        let _ = self.events_tx.send(ConnectionEvent::Connected);
                    }
                    Action::Deliver(plaintext) => {
                        let _ = self
                            .events_tx
                            .send(ConnectionEvent::NetMsgReceived(plaintext));
                    }
                    Action::Disconnect(e) => {
                        warn!("encrypted channel failed: {}", e);
                        self.inner.disconnect(false);
                    }
                    Action::Ignore => {}
                }
            }
        }
    }
}
