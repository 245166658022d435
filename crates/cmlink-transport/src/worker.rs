//! Per-session worker plumbing shared by the carriers.
//!
//! Each connect attempt gets one [`SessionHandle`]: a cancellation token, an
//! event emitter that enforces the single-fire event rules, and a clone of the
//! session's TCP stream (when it has one) so that another thread can shut the
//! socket down and unblock the worker.

use crossbeam_channel::Sender;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::ConnectionEvent;

/// Lock a mutex, recovering the data if a worker panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether an I/O error is a read/write timeout rather than a fault
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Spawn a named worker thread for one session
///
/// The session is closed when `f` returns or unwinds, so a worker can never
/// exit without `Disconnected` being raised.
pub(crate) fn spawn_worker<F>(
    name: &str,
    handle: Arc<SessionHandle>,
    f: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let _guard = CloseGuard(handle);
        f();
    })
}

struct CloseGuard(Arc<SessionHandle>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!("session worker panicked, closing session");
        }
        self.0.close(false);
    }
}

/// Open a TCP stream, failing if the handshake does not finish within `timeout`
pub(crate) fn connect_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

/// Cooperative cancellation flag checked at the top of every worker iteration
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    user_initiated: AtomicBool,
}

impl CancelToken {
    pub(crate) fn cancel(&self, user_initiated: bool) {
        self.inner
            .user_initiated
            .store(user_initiated, Ordering::Release);
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn user_initiated(&self) -> bool {
        self.inner.user_initiated.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    Closed,
}

/// Event sender for one connect attempt
///
/// Holds the phase under the same lock as the send, so a message can never
/// slip in behind `Disconnected` even when two threads race.
#[derive(Debug)]
pub(crate) struct EventEmitter {
    state: Mutex<(Phase, Sender<ConnectionEvent>)>,
}

impl EventEmitter {
    pub(crate) fn new(tx: Sender<ConnectionEvent>) -> Self {
        Self {
            state: Mutex::new((Phase::Connecting, tx)),
        }
    }

    /// Raise `Connected`; only the first call from the connecting phase fires
    pub(crate) fn connected(&self) -> bool {
        let mut state = lock(&self.state);
        if state.0 != Phase::Connecting {
            return false;
        }
        state.0 = Phase::Connected;
        let _ = state.1.send(ConnectionEvent::Connected);
        true
    }

    /// Raise `NetMsgReceived`; dropped unless connected
    pub(crate) fn message(&self, data: Vec<u8>) -> bool {
        let state = lock(&self.state);
        if state.0 != Phase::Connected {
            debug!("discarding {} byte message outside connected phase", data.len());
            return false;
        }
        let _ = state.1.send(ConnectionEvent::NetMsgReceived(data));
        true
    }

    /// Raise `Disconnected`; only the first call fires
    pub(crate) fn disconnected(&self, user_initiated: bool) -> bool {
        let mut state = lock(&self.state);
        if state.0 == Phase::Closed {
            return false;
        }
        state.0 = Phase::Closed;
        let _ = state.1.send(ConnectionEvent::Disconnected { user_initiated });
        true
    }

    pub(crate) fn is_connected(&self) -> bool {
        lock(&self.state).0 == Phase::Connected
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).0 == Phase::Closed
    }
}

/// State shared between a carrier and the worker of one connect attempt
#[derive(Debug)]
pub(crate) struct SessionHandle {
    pub(crate) cancel: CancelToken,
    pub(crate) events: EventEmitter,
    stream: Mutex<Option<TcpStream>>,
    local_ip: Mutex<Option<IpAddr>>,
}

impl SessionHandle {
    pub(crate) fn new(tx: Sender<ConnectionEvent>) -> Arc<Self> {
        Arc::new(Self {
            cancel: CancelToken::default(),
            events: EventEmitter::new(tx),
            stream: Mutex::new(None),
            local_ip: Mutex::new(None),
        })
    }

    /// Keep a clone of the worker's stream so [`SessionHandle::close`] can shut it down
    pub(crate) fn attach_stream(&self, stream: &TcpStream) -> io::Result<()> {
        let clone = stream.try_clone()?;
        if let Ok(addr) = stream.local_addr() {
            *lock(&self.local_ip) = Some(addr.ip());
        }
        *lock(&self.stream) = Some(clone);

        // close() may have run between connect and attach
        if self.cancel.is_cancelled() {
            self.shutdown_stream();
        }
        Ok(())
    }

    pub(crate) fn set_local_ip(&self, ip: IpAddr) {
        *lock(&self.local_ip) = Some(ip);
    }

    pub(crate) fn local_ip(&self) -> Option<IpAddr> {
        *lock(&self.local_ip)
    }

    fn shutdown_stream(&self) {
        if let Some(stream) = lock(&self.stream).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Cancel the worker, shut the socket down and raise `Disconnected`.
    ///
    /// Idempotent: later calls, including the worker's own on exit, do nothing.
    pub(crate) fn close(&self, user_initiated: bool) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel(user_initiated);
        }
        self.shutdown_stream();
        self.events.disconnected(user_initiated);
    }
}
