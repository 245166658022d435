//! Reliable-sequenced UDP carrier.
//!
//! The wire format lives in [`packet`], the sequencing rules in
//! [`sequencer`]. [`UdpConnection`] runs one worker thread per session that
//! owns the socket and the [`Sequencer`]; callers talk to it over a command
//! channel.

pub mod packet;
pub mod sequencer;

pub use packet::{
    CHALLENGE_MASK, ChallengeData, ConnectData, HEADER_SIZE, INITIAL_CONN_ID, MAX_PAYLOAD,
    PACKET_MAGIC, PacketType, UdpHeader, UdpPacket,
};
pub use sequencer::{Received, Sequencer, UdpConfig, UdpState};

use crossbeam_channel::{Receiver, Sender, unbounded};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent};
use crate::endpoint::{Endpoint, ProtocolTypes};
use crate::error::{TransportError, TransportResult};
use crate::worker::{SessionHandle, is_timeout, lock, spawn_worker};

/// Amount the local connection ID advances per session
const CONN_ID_STEP: u32 = 256;

const RECV_BUFFER_SIZE: usize = 2048;

enum Command {
    Send(Vec<u8>),
    Disconnect { user_initiated: bool },
}

struct UdpSession {
    endpoint: Endpoint,
    handle: Arc<SessionHandle>,
    commands: Sender<Command>,
}

/// Connection over the reliable-sequenced UDP protocol
pub struct UdpConnection {
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    config: UdpConfig,
    next_conn_id: AtomicU32,
    session: Mutex<Option<UdpSession>>,
}

impl UdpConnection {
    /// Create an idle connection with default timings
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(UdpConfig::default())
    }

    /// Create an idle connection with custom timings
    #[must_use]
    pub fn with_config(config: UdpConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            events_tx,
            events_rx,
            config,
            next_conn_id: AtomicU32::new(INITIAL_CONN_ID),
            session: Mutex::new(None),
        }
    }

    /// Connection ID the next session will use; each connect advances it
    #[must_use]
    pub fn next_conn_id(&self) -> u32 {
        self.next_conn_id.load(Ordering::Acquire)
    }
}

impl Default for UdpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for UdpConnection {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) {
        let handle = SessionHandle::new(self.events_tx.clone());
        let (commands, commands_rx) = unbounded();

        let previous = lock(&self.session).replace(UdpSession {
            endpoint: endpoint.clone(),
            handle: handle.clone(),
            commands,
        });
        if let Some(previous) = previous {
            debug!("replacing udp session to {}", previous.endpoint);
            previous.handle.close(false);
        }

        let local_conn_id = self.next_conn_id.fetch_add(CONN_ID_STEP, Ordering::AcqRel);
        debug!(
            "connecting to {} over udp as connection {} (timeout {:?})",
            endpoint, local_conn_id, timeout
        );

        let worker = Worker {
            endpoint: endpoint.clone(),
            timeout,
            local_conn_id,
            config: self.config.clone(),
            handle: handle.clone(),
            commands: commands_rx,
        };
        if let Err(e) = spawn_worker("cmlink-udp", handle.clone(), move || worker.run()) {
            warn!("failed to spawn udp worker: {}", e);
            handle.close(false);
        }
    }

    fn disconnect(&self, user_initiated: bool) {
        let session = lock(&self.session);
        match session.as_ref() {
            Some(session) if session.handle.events.is_connected() => {
                debug!("disconnecting udp session to {}", session.endpoint);
                if session
                    .commands
                    .send(Command::Disconnect { user_initiated })
                    .is_err()
                {
                    session.handle.close(user_initiated);
                }
            }
            Some(session) => session.handle.close(user_initiated),
            None => debug!("udp disconnect requested with no session"),
        }
    }

    fn send(&self, data: Vec<u8>) {
        let session = lock(&self.session);
        match session.as_ref() {
            Some(session) if session.handle.events.is_connected() => {
                if session.commands.send(Command::Send(data)).is_err() {
                    debug!("udp worker gone, dropping payload");
                }
            }
            _ => debug!("dropping {} byte payload, udp not connected", data.len()),
        }
    }

    fn events(&self) -> Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }

    fn current_endpoint(&self) -> Option<Endpoint> {
        lock(&self.session)
            .as_ref()
            .filter(|s| !s.handle.events.is_closed())
            .map(|s| s.endpoint.clone())
    }

    fn local_ip(&self) -> Option<IpAddr> {
        lock(&self.session)
            .as_ref()
            .and_then(|s| s.handle.local_ip())
    }

    fn protocol_types(&self) -> ProtocolTypes {
        ProtocolTypes::UDP
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.handle.close(true);
        }
    }
}

/// Open a UDP socket bound to the wildcard address and connected to `remote`
fn open_socket(remote: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&local.into())?;
    socket.connect(&remote.into())?;
    Ok(socket.into())
}

struct Worker {
    endpoint: Endpoint,
    timeout: Duration,
    local_conn_id: u32,
    config: UdpConfig,
    handle: Arc<SessionHandle>,
    commands: Receiver<Command>,
}

impl Worker {
    fn run(&self) {
        let user_initiated = match self.session_loop() {
            Ok(user_initiated) => user_initiated,
            Err(e) if self.handle.cancel.is_cancelled() => {
                debug!("udp session to {} ended during teardown: {}", self.endpoint, e);
                self.handle.cancel.user_initiated()
            }
            Err(e) => {
                warn!("udp session to {} failed: {}", self.endpoint, e);
                false
            }
        };
        self.handle.close(user_initiated);
    }

    /// Drive the session until it ends; returns whether the end was user-initiated
    fn session_loop(&self) -> TransportResult<bool> {
        let addr = self.endpoint.resolve()?;
        let socket = open_socket(addr)?;
        socket.set_read_timeout(Some(self.config.poll_interval))?;
        if let Ok(local) = socket.local_addr() {
            self.handle.set_local_ip(local.ip());
        }

        let started = Instant::now();
        let connect_deadline = started + self.timeout;
        let mut sequencer = Sequencer::new(self.local_conn_id, self.config.clone(), started);
        socket.send(&sequencer.begin(started).encode())?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut graceful_user_initiated = None;

        loop {
            if self.handle.cancel.is_cancelled() {
                return Ok(self.handle.cancel.user_initiated());
            }

            let received_any = self.receive_burst(&socket, &mut buf, &mut sequencer)?;
            let now = Instant::now();

            if sequencer.state() == UdpState::Disconnected {
                for packet in sequencer.poll_transmit(now) {
                    socket.send(&packet.encode())?;
                }
                return Ok(false);
            }
            if !received_any && sequencer.is_timed_out(now) {
                return Err(TransportError::Timeout);
            }
            if matches!(
                sequencer.state(),
                UdpState::ChallengeReqSent | UdpState::ConnectSent
            ) && now > connect_deadline
            {
                return Err(TransportError::Timeout);
            }

            for command in self.commands.try_iter() {
                match command {
                    Command::Send(data) if sequencer.state() == UdpState::Connected => {
                        sequencer.queue_message(&data)?;
                    }
                    Command::Send(data) => {
                        debug!("dropping {} byte payload while disconnecting", data.len());
                    }
                    Command::Disconnect { user_initiated } => {
                        if !sequencer.begin_disconnect() {
                            return Ok(user_initiated);
                        }
                        graceful_user_initiated = Some(user_initiated);
                    }
                }
            }

            for packet in sequencer.poll_transmit(now) {
                socket.send(&packet.encode())?;
            }

            if sequencer.is_drained() {
                debug!("udp session to {} drained", self.endpoint);
                return Ok(graceful_user_initiated.unwrap_or(true));
            }
        }
    }

    /// Wait for one datagram, then take whatever else arrives in quick succession
    fn receive_burst(
        &self,
        socket: &UdpSocket,
        buf: &mut [u8],
        sequencer: &mut Sequencer,
    ) -> TransportResult<bool> {
        let mut received_any = false;

        loop {
            match socket.recv(buf) {
                Ok(n) => {
                    self.handle_datagram(&buf[..n], sequencer);
                    if !received_any {
                        received_any = true;
                        socket.set_read_timeout(Some(self.config.drain_interval))?;
                    }
                    if sequencer.state() == UdpState::Disconnected {
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if received_any {
            socket.set_read_timeout(Some(self.config.poll_interval))?;
        }
        Ok(received_any)
    }

    fn handle_datagram(&self, data: &[u8], sequencer: &mut Sequencer) {
        let packet = match UdpPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("ignoring malformed udp datagram: {}", e);
                return;
            }
        };

        let received = sequencer.receive(packet, Instant::now());
        if received.connected {
            info!(
                "udp connected to {} (remote connection {})",
                self.endpoint,
                sequencer.remote_conn_id()
            );
            self.handle.events.connected();
        }
        for message in received.messages {
            self.handle.events.message(message);
        }
    }
}
