//! WebSocket carrier.
//!
//! Connects to `wss://host:port/cmsocket/` and carries each payload as one
//! binary message. TLS is provided by the WebSocket layer, so this carrier is
//! never wrapped in the envelope encryption.

use crossbeam_channel::{Receiver, Sender, unbounded};
use native_tls::TlsConnector;
use std::net::{IpAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::connection::{Connection, ConnectionEvent};
use crate::endpoint::{Endpoint, ProtocolTypes};
use crate::error::{TransportError, TransportResult};
use crate::worker::{SessionHandle, connect_tcp, is_timeout, lock, spawn_worker};

/// Request path on the server
pub const WEBSOCKET_PATH: &str = "/cmsocket/";

/// Upper bound on how long the worker blocks in a read
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// WebSocket carrier options
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Use `wss://`; plain `ws://` when false
    pub tls: bool,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self { tls: true }
    }
}

impl WebSocketOptions {
    /// URI for an endpoint
    #[must_use]
    pub fn uri(&self, endpoint: &Endpoint) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{endpoint}{WEBSOCKET_PATH}")
    }
}

struct WebSocketSession {
    endpoint: Endpoint,
    handle: Arc<SessionHandle>,
    outbound: Sender<Vec<u8>>,
}

/// Connection carried over a WebSocket
pub struct WebSocketConnection {
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    options: WebSocketOptions,
    session: Mutex<Option<WebSocketSession>>,
}

impl WebSocketConnection {
    /// Create an idle connection that uses TLS
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(WebSocketOptions::default())
    }

    /// Create an idle connection with explicit options
    #[must_use]
    pub fn with_options(options: WebSocketOptions) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            events_tx,
            events_rx,
            options,
            session: Mutex::new(None),
        }
    }
}

impl Default for WebSocketConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for WebSocketConnection {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) {
        let handle = SessionHandle::new(self.events_tx.clone());
        let (outbound, outbound_rx) = unbounded();

        let previous = lock(&self.session).replace(WebSocketSession {
            endpoint: endpoint.clone(),
            handle: handle.clone(),
            outbound,
        });
        if let Some(previous) = previous {
            debug!("replacing websocket session to {}", previous.endpoint);
            previous.handle.close(false);
        }

        let uri = self.options.uri(endpoint);
        debug!("connecting to {} (timeout {:?})", uri, timeout);

        let worker_handle = handle.clone();
        let endpoint = endpoint.clone();
        let tls = self.options.tls;
        if let Err(e) = spawn_worker("cmlink-websocket", handle.clone(), move || {
            run_worker(&endpoint, &uri, tls, timeout, &worker_handle, &outbound_rx);
        }) {
            warn!("failed to spawn websocket worker: {}", e);
            handle.close(false);
        }
    }

    fn disconnect(&self, user_initiated: bool) {
        match lock(&self.session).take() {
            Some(session) => {
                debug!("disconnecting websocket session to {}", session.endpoint);
                session.handle.close(user_initiated);
            }
            None => debug!("websocket disconnect requested with no session"),
        }
    }

    fn send(&self, data: Vec<u8>) {
        let session = lock(&self.session);
        match session.as_ref() {
            Some(session) if session.handle.events.is_connected() => {
                if session.outbound.send(data).is_err() {
                    debug!("websocket worker gone, dropping payload");
                }
            }
            _ => debug!("dropping {} byte payload, websocket not connected", data.len()),
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
        ProtocolTypes::WEB_SOCKET
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.handle.close(true);
        }
    }
}

fn run_worker(
    endpoint: &Endpoint,
    uri: &str,
    tls: bool,
    timeout: Duration,
    handle: &SessionHandle,
    outbound: &Receiver<Vec<u8>>,
) {
    let result = open(endpoint, uri, tls, timeout, handle)
        .and_then(|socket| session_loop(socket, uri, handle, outbound));
    let user_initiated = match result {
        Ok(()) => handle.cancel.user_initiated(),
        Err(e) if handle.cancel.is_cancelled() => {
            debug!("websocket session to {} ended during teardown: {}", uri, e);
            handle.cancel.user_initiated()
        }
        Err(e) => {
            warn!("websocket session to {} failed: {}", uri, e);
            false
        }
    };
    handle.close(user_initiated);
}

/// TCP connect, TLS, then the HTTP upgrade, all within one `timeout` budget
fn open(
    endpoint: &Endpoint,
    uri: &str,
    tls: bool,
    timeout: Duration,
    handle: &SessionHandle,
) -> TransportResult<Socket> {
    let deadline = Instant::now() + timeout;
    let addr = endpoint.resolve()?;

    let tcp = connect_tcp(addr, timeout).map_err(|e| {
        if is_timeout(&e) {
            TransportError::Timeout
        } else {
            TransportError::ConnectionFailed(format!("{endpoint}: {e}"))
        }
    })?;
    handle.attach_stream(&tcp)?;

    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1));
    tcp.set_nodelay(true)?;
    tcp.set_read_timeout(Some(remaining))?;
    tcp.set_write_timeout(Some(remaining))?;

    let stream = if tls {
        let connector = TlsConnector::new()
            .map_err(|e| TransportError::WebSocket(format!("tls setup failed: {e}")))?;
        let tls_stream = connector
            .connect(endpoint.host(), tcp)
            .map_err(|e| TransportError::WebSocket(format!("tls handshake failed: {e}")))?;
        MaybeTlsStream::NativeTls(tls_stream)
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let request = uri
        .into_client_request()
        .map_err(|e| TransportError::WebSocket(format!("invalid request: {e}")))?;
    let (socket, _response) = tungstenite::client(request, stream)
        .map_err(|e| TransportError::WebSocket(format!("handshake failed: {e}")))?;

    let tcp = match socket.get_ref() {
        MaybeTlsStream::Plain(s) => s,
        MaybeTlsStream::NativeTls(s) => s.get_ref(),
        _ => return Err(TransportError::WebSocket("unsupported stream".to_string())),
    };
    tcp.set_read_timeout(Some(POLL_INTERVAL))?;
    tcp.set_write_timeout(Some(WRITE_TIMEOUT))?;

    Ok(socket)
}

fn session_loop(
    mut socket: Socket,
    uri: &str,
    handle: &SessionHandle,
    outbound: &Receiver<Vec<u8>>,
) -> TransportResult<()> {
    if handle.cancel.is_cancelled() {
        return Ok(());
    }

    info!("websocket connected to {}", uri);
    handle.events.connected();

    loop {
        if handle.cancel.is_cancelled() {
            let _ = socket.close(None);
            return Ok(());
        }

        for payload in outbound.try_iter() {
            let len = payload.len();
            socket.send(Message::Binary(payload)).map_err(ws_error)?;
            debug!("websocket sent {} byte payload", len);
        }

        match socket.read() {
            Ok(Message::Binary(data)) => {
                debug!("websocket received {} byte payload", data.len());
                handle.events.message(data);
            }
            Ok(Message::Text(text)) => {
                debug!("ignoring {} byte text message", text.len());
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                debug!("websocket closed by server: {:?}", frame);
                return Err(TransportError::Closed);
            }
            Ok(other) => {
                debug!("unexpected websocket message: {:?}", other);
                return Err(TransportError::Closed);
            }
            Err(tungstenite::Error::Io(e)) if is_timeout(&e) => {}
            Err(e) => return Err(ws_error(e)),
        }
    }
}

fn ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Io(e) => TransportError::Io(e),
        other => TransportError::WebSocket(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    fn plain() -> WebSocketOptions {
        WebSocketOptions { tls: false }
    }

    #[test]
    fn test_uri() {
        let endpoint: Endpoint = "cm1.example.net:27020".parse().unwrap();
        assert_eq!(
            WebSocketOptions::default().uri(&endpoint),
            "wss://cm1.example.net:27020/cmsocket/"
        );
        assert_eq!(plain().uri(&endpoint), "ws://cm1.example.net:27020/cmsocket/");
    }

    #[test]
    fn test_binary_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        let (received_tx, received_rx) = unbounded();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            ws.send(Message::Text("ignored".into())).unwrap();
            ws.send(Message::Binary(b"from server".to_vec())).unwrap();
            // Hold the socket open until the client goes away
            while let Ok(message) = ws.read() {
                if let Message::Binary(data) = message {
                    received_tx.send(data).unwrap();
                }
            }
        });

        let conn = WebSocketConnection::with_options(plain());
        let events = conn.events();
        conn.connect(&endpoint, WAIT);

        assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ConnectionEvent::NetMsgReceived(b"from server".to_vec())
        );

        conn.send(b"from client".to_vec());
        assert_eq!(received_rx.recv_timeout(WAIT).unwrap(), b"from client".to_vec());
        assert_eq!(conn.protocol_types(), ProtocolTypes::WEB_SOCKET);

        conn.disconnect(true);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ConnectionEvent::Disconnected {
                user_initiated: true
            }
        );
    }

    #[test]
    fn test_upgrade_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        std::thread::spawn(move || {
            use std::io::{Read, Write};
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        });

        let conn = WebSocketConnection::with_options(plain());
        let events = conn.events();
        conn.connect(&endpoint, WAIT);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ConnectionEvent::Disconnected {
                user_initiated: false
            }
        );
    }

    #[test]
    fn test_server_close_frame_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            ws.close(None).unwrap();
            while ws.read().is_ok() {}
        });

        let conn = WebSocketConnection::with_options(plain());
        let events = conn.events();
        conn.connect(&endpoint, WAIT);

        assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ConnectionEvent::Disconnected {
                user_initiated: false
            }
        );
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(conn.current_endpoint().is_none());
    }

    #[test]
    fn test_reconnect_replaces_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        let (ended_tx, ended_rx) = unbounded();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut first = tungstenite::accept(stream).unwrap();
            std::thread::spawn(move || {
                while first.read().is_ok() {}
                let _ = ended_tx.send(());
            });

            let (stream, _) = listener.accept().unwrap();
            let mut second = tungstenite::accept(stream).unwrap();
            second.send(Message::Binary(b"second session".to_vec())).unwrap();
            while second.read().is_ok() {}
        });

        let conn = WebSocketConnection::with_options(plain());
        let events = conn.events();
        conn.connect(&endpoint, WAIT);
        assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);

        conn.connect(&endpoint, WAIT);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ConnectionEvent::Disconnected {
                user_initiated: false
            }
        );
        assert!(ended_rx.recv_timeout(WAIT).is_ok());

        assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ConnectionEvent::NetMsgReceived(b"second session".to_vec())
        );
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
