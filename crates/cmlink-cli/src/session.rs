//! Session runner: candidate selection, carrier setup and quality feedback.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use cmlink_core::{EnvelopeConfig, EnvelopeEncryptedConnection};
use cmlink_discovery::{ServerQuality, ServerRecord, SmartCmServerList};
use cmlink_transport::{
    Connection, ConnectionEvent, ProtocolTypes, TcpConnection, UdpConnection,
    WebSocketConnection, WebSocketOptions,
};

/// Bytes of each inbound payload shown in the log
const PREVIEW_LEN: usize = 16;

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stayed connected for the whole duration
    Completed,
    /// Connected, then dropped by the server or the network
    Dropped,
    /// Never reached `Connected`
    Failed,
}

/// Settings for [`SessionRunner`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Carriers to draw candidates for
    pub protocols: ProtocolTypes,
    /// Connect timeout handed to the carrier
    pub connect_timeout: Duration,
    /// Candidates tried before giving up
    pub max_attempts: u32,
    /// WebSocket carrier options
    pub websocket: WebSocketOptions,
}

/// Drives connections against a server list
pub struct SessionRunner<'a> {
    servers: &'a SmartCmServerList,
    settings: SessionSettings,
    envelope: Option<EnvelopeConfig>,
}

impl<'a> SessionRunner<'a> {
    /// Create a runner; `envelope` is required for TCP and UDP candidates
    #[must_use]
    pub fn new(
        servers: &'a SmartCmServerList,
        settings: SessionSettings,
        envelope: Option<EnvelopeConfig>,
    ) -> Self {
        Self {
            servers,
            settings,
            envelope,
        }
    }

    /// Build the connection stack for one carrier
    ///
    /// TCP and UDP are wrapped in envelope encryption; WebSocket relies on TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if a TCP or UDP carrier is requested without an
    /// envelope configuration, or if the decorator cannot start.
    pub fn open_carrier(&self, protocol: ProtocolTypes) -> anyhow::Result<Box<dyn Connection>> {
        if protocol == ProtocolTypes::WEB_SOCKET {
            return Ok(Box::new(WebSocketConnection::with_options(
                self.settings.websocket.clone(),
            )));
        }

        let Some(envelope) = self.envelope.clone() else {
            anyhow::bail!("{protocol} sessions need an [encryption] public_key");
        };
        let conn: Box<dyn Connection> = match protocol {
            ProtocolTypes::TCP => Box::new(EnvelopeEncryptedConnection::new(
                TcpConnection::new(),
                envelope,
            )?),
            ProtocolTypes::UDP => Box::new(EnvelopeEncryptedConnection::new(
                UdpConnection::new(),
                envelope,
            )?),
            other => anyhow::bail!("no single carrier for {other}"),
        };
        Ok(conn)
    }

    /// Connect to weighted candidates until one stays up for `duration`
    ///
    /// Every attempt feeds its outcome back into the server list. Attempts
    /// that fail or drop move on to the next candidate.
    ///
    /// # Errors
    ///
    /// Returns an error if the list has no candidate for the configured
    /// carriers or every attempt failed.
    pub fn run(&self, duration: Duration) -> anyhow::Result<ServerRecord> {
        for attempt in 1..=self.settings.max_attempts {
            let Some(candidate) = self.servers.next_server_candidate(self.settings.protocols)
            else {
                anyhow::bail!("no server offers {}", self.settings.protocols);
            };
            info!(
                "attempt {}/{}: {}",
                attempt, self.settings.max_attempts, candidate
            );

            match self.attempt(&candidate, duration)? {
                Outcome::Completed => return Ok(candidate),
                Outcome::Dropped | Outcome::Failed => {}
            }
        }
        anyhow::bail!(
            "no session stayed up after {} attempts",
            self.settings.max_attempts
        )
    }

    /// Run one session against `candidate`
    ///
    /// # Errors
    ///
    /// Returns an error only if the carrier cannot be built.
    pub fn attempt(&self, candidate: &ServerRecord, duration: Duration) -> anyhow::Result<Outcome> {
        let conn = self.open_carrier(candidate.protocol_types())?;
        let events = conn.events();
        conn.connect(candidate.endpoint(), self.settings.connect_timeout);

        // The envelope handshake needs a round trip on top of the carrier connect
        let budget = self.settings.connect_timeout * 2;
        if !wait_connected(&events, budget) {
            conn.disconnect(true);
            self.mark(candidate, ServerQuality::Bad);
            return Ok(Outcome::Failed);
        }

        self.mark(candidate, ServerQuality::Good);
        info!(
            "connected to {} over {} (local {})",
            candidate.endpoint(),
            candidate.protocol_types(),
            conn.local_ip()
                .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
        );

        let outcome = stay(&events, duration);
        if outcome == Outcome::Dropped {
            self.mark(candidate, ServerQuality::Bad);
        } else {
            conn.disconnect(true);
            if !wait_closed(&events, self.settings.connect_timeout) {
                warn!("{} did not confirm the disconnect", candidate);
            }
        }
        Ok(outcome)
    }

    fn mark(&self, candidate: &ServerRecord, quality: ServerQuality) {
        if let Err(e) = self
            .servers
            .mark(candidate.endpoint(), candidate.protocol_types(), quality)
        {
            warn!("{}", e);
        }
    }
}

/// Wait for `Connected`; `false` on a disconnect or timeout
fn wait_connected(events: &Receiver<ConnectionEvent>, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(ConnectionEvent::Connected) => return true,
            Ok(ConnectionEvent::Disconnected { user_initiated }) => {
                debug!("connect failed (user_initiated: {})", user_initiated);
                return false;
            }
            Ok(ConnectionEvent::NetMsgReceived(_)) => {}
            Err(RecvTimeoutError::Timeout) => {
                warn!("no session after {:?}", budget);
                return false;
            }
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

/// Wait for the `Disconnected` that ends a session; `false` if it never came
fn wait_closed(events: &Receiver<ConnectionEvent>, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(ConnectionEvent::Disconnected { user_initiated }) => {
                debug!("session closed (user_initiated: {})", user_initiated);
                return true;
            }
            Ok(event) => debug!("discarding {:?} during teardown", event),
            Err(_) => return false,
        }
    }
}

/// Log inbound payloads until `duration` passes or the session drops
fn stay(events: &Receiver<ConnectionEvent>, duration: Duration) -> Outcome {
    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Outcome::Completed;
        }
        match events.recv_timeout(remaining) {
            Ok(ConnectionEvent::NetMsgReceived(data)) => {
                let shown = &data[..data.len().min(PREVIEW_LEN)];
                info!("received {} bytes: {}", data.len(), hex::encode(shown));
            }
            Ok(ConnectionEvent::Disconnected { user_initiated }) => {
                warn!("session dropped (user_initiated: {})", user_initiated);
                return Outcome::Dropped;
            }
            Ok(ConnectionEvent::Connected) => {}
            Err(RecvTimeoutError::Timeout) => return Outcome::Completed,
            Err(RecvTimeoutError::Disconnected) => return Outcome::Dropped,
        }
    }
}
