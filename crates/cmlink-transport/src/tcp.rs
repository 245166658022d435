//! Framed TCP carrier.
//!
//! One worker thread per session owns the socket. Each iteration it checks
//! for cancellation, flushes the outbound queue, then waits up to
//! [`POLL_INTERVAL`] for inbound bytes and feeds them to the frame decoder.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent};
use crate::endpoint::{Endpoint, ProtocolTypes};
use crate::error::{TransportError, TransportResult};
use crate::frame::{FrameDecoder, encode_frame};
use crate::worker::{SessionHandle, connect_tcp, is_timeout, lock, spawn_worker};

/// Upper bound on how long the worker blocks in a read
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Write timeout once connected
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 64 * 1024;

struct TcpSession {
    endpoint: Endpoint,
    handle: Arc<SessionHandle>,
    outbound: Sender<Vec<u8>>,
}

/// Connection that frames payloads over a TCP stream
pub struct TcpConnection {
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    session: Mutex<Option<TcpSession>>,
}

impl TcpConnection {
    /// Create an idle connection
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            events_tx,
            events_rx,
            session: Mutex::new(None),
        }
    }
}

impl Default for TcpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for TcpConnection {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) {
        let handle = SessionHandle::new(self.events_tx.clone());
        let (outbound, outbound_rx) = unbounded();

        let previous = lock(&self.session).replace(TcpSession {
            endpoint: endpoint.clone(),
            handle: handle.clone(),
            outbound,
        });
        if let Some(previous) = previous {
            debug!("replacing tcp session to {}", previous.endpoint);
            previous.handle.close(false);
        }

        debug!("connecting to {} over tcp (timeout {:?})", endpoint, timeout);

        let worker_handle = handle.clone();
        let endpoint = endpoint.clone();
        if let Err(e) = spawn_worker("cmlink-tcp", handle.clone(), move || {
            run_worker(&endpoint, timeout, &worker_handle, &outbound_rx);
        }) {
            warn!("failed to spawn tcp worker: {}", e);
            handle.close(false);
        }
    }

    fn disconnect(&self, user_initiated: bool) {
        match lock(&self.session).take() {
            Some(session) => {
                debug!("disconnecting tcp session to {}", session.endpoint);
                session.handle.close(user_initiated);
            }
            None => debug!("tcp disconnect requested with no session"),
        }
    }

    fn send(&self, data: Vec<u8>) {
        let session = lock(&self.session);
        match session.as_ref() {
            Some(session) if session.handle.events.is_connected() => {
                if session.outbound.send(data).is_err() {
                    debug!("tcp worker gone, dropping payload");
                }
            }
            _ => debug!("dropping {} byte payload, tcp not connected", data.len()),
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
        ProtocolTypes::TCP
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.handle.close(true);
        }
    }
}

fn run_worker(
    endpoint: &Endpoint,
    timeout: Duration,
    handle: &SessionHandle,
    outbound: &Receiver<Vec<u8>>,
) {
    let user_initiated = match session_loop(endpoint, timeout, handle, outbound) {
        Ok(()) => handle.cancel.user_initiated(),
        Err(e) if handle.cancel.is_cancelled() => {
            debug!("tcp session to {} ended during teardown: {}", endpoint, e);
            handle.cancel.user_initiated()
        }
        Err(e) => {
            warn!("tcp session to {} failed: {}", endpoint, e);
            false
        }
    };
    handle.close(user_initiated);
}

fn session_loop(
    endpoint: &Endpoint,
    timeout: Duration,
    handle: &SessionHandle,
    outbound: &Receiver<Vec<u8>>,
) -> TransportResult<()> {
    let addr = endpoint.resolve()?;
    let mut stream = connect_tcp(addr, timeout).map_err(|e| {
        if is_timeout(&e) {
            TransportError::Timeout
        } else {
            TransportError::ConnectionFailed(format!("{endpoint}: {e}"))
        }
    })?;

    handle.attach_stream(&stream)?;
    if handle.cancel.is_cancelled() {
        return Ok(());
    }

    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    info!("tcp connected to {} ({})", endpoint, addr);
    handle.events.connected();

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if handle.cancel.is_cancelled() {
            return Ok(());
        }

        flush_outbound(&mut stream, outbound)?;

        match stream.read(&mut buf) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => {
                decoder.extend(&buf[..n]);
                while let Some(payload) = decoder.next_frame()? {
                    debug!("tcp received {} byte payload", payload.len());
                    handle.events.message(payload);
                }
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn flush_outbound(stream: &mut TcpStream, outbound: &Receiver<Vec<u8>>) -> TransportResult<()> {
    for payload in outbound.try_iter() {
        let frame = encode_frame(&payload)?;
        stream.write_all(&frame)?;
        debug!("tcp sent {} byte payload", payload.len());
    }
    Ok(())
}
