//! Bidirectional framed-byte channels between the adapter and the client.
//!
//! A transport owns at most one active session at a time. The server
//! variants keep listening after a disconnect so a new client can attach;
//! additional clients that connect while a session is active are rejected
//! by closing their socket. All variants are single-threaded and driven by
//! `update`, which performs the accept/read/flush work for one poll tick.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint address {0:?}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CloseHook = Box<dyn FnMut() + Send>;

pub trait Transport: Send {
    /// Bytes buffered and ready for [`Transport::recv`].
    fn peek(&mut self) -> usize;

    /// Consume exactly `buf.len()` buffered bytes. Returns false if that
    /// many bytes are not available or the channel is closed.
    fn recv(&mut self, buf: &mut [u8]) -> bool;

    /// Queue `buf` for delivery. Returns false when no session is active.
    fn send(&mut self, buf: &[u8]) -> bool;

    /// Drive the channel for one tick: accept a pending client, flush
    /// queued output, pull readable input. `timeout` bounds how long the
    /// call may wait for readiness when nothing is pending.
    fn update(&mut self, timeout: Duration);

    /// Tear down the active session (the server variants keep listening).
    fn close(&mut self);

    /// True while no session is active.
    fn is_closed(&self) -> bool;

    /// Invoked once each time an active session goes away.
    fn set_close_hook(&mut self, hook: CloseHook);

    /// Bound port for the TCP server variant; 0 elsewhere.
    fn get_port(&self) -> u16 {
        0
    }
}

/// Endpoint address forms accepted by [`listen`] and [`connect`]:
/// `host:port`, a bare port, or a filesystem path for a unix socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(addr: &str) -> Result<Self, TransportError> {
        if let Ok(port) = addr.parse::<u16>() {
            return Ok(Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            });
        }
        if let Some((host, port)) = addr.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                });
            }
        }
        if addr.is_empty() {
            return Err(TransportError::InvalidEndpoint(addr.to_string()));
        }
        Ok(Endpoint::Unix(PathBuf::from(addr)))
    }
}

/// Listen on `addr` and accept exactly one client at a time.
pub fn listen(addr: &str) -> Result<Box<dyn Transport>, TransportError> {
    match Endpoint::parse(addr)? {
        Endpoint::Tcp { host, port } => Ok(Box::new(TcpServerTransport::bind(&host, port)?)),
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(UnixServerTransport::bind(&path)?)),
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Err(TransportError::InvalidEndpoint(path.display().to_string())),
    }
}

/// Connect to a listening client at `addr`.
pub fn connect(addr: &str) -> Result<Box<dyn Transport>, TransportError> {
    match Endpoint::parse(addr)? {
        Endpoint::Tcp { host, port } => Ok(Box::new(TcpClientTransport::connect(&host, port)?)),
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(UnixClientTransport::connect(&path)?)),
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Err(TransportError::InvalidEndpoint(path.display().to_string())),
    }
}

/// Buffered session state shared by every socket-backed transport.
struct StreamBuf {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    close_hook: Option<CloseHook>,
}

impl StreamBuf {
    fn new() -> Self {
        Self {
            inbound: Vec::new(),
            outbound: Vec::new(),
            close_hook: None,
        }
    }

    fn fire_close(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
        if let Some(hook) = self.close_hook.as_mut() {
            hook();
        }
    }

    /// Flush pending output and drain readable input. Returns false when
    /// the peer went away.
    fn pump<S: Read + Write>(&mut self, stream: &mut S) -> bool {
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => return false,
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }

        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
        true
    }

    fn recv(&mut self, buf: &mut [u8]) -> bool {
        if self.inbound.len() < buf.len() {
            return false;
        }
        buf.copy_from_slice(&self.inbound[..buf.len()]);
        self.inbound.drain(..buf.len());
        true
    }
}

macro_rules! socket_transport_common {
    () => {
        fn peek(&mut self) -> usize {
            self.buf.inbound.len()
        }

        fn recv(&mut self, buf: &mut [u8]) -> bool {
            if self.stream.is_none() && self.buf.inbound.is_empty() {
                return false;
            }
            self.buf.recv(buf)
        }

        fn send(&mut self, buf: &[u8]) -> bool {
            if self.stream.is_none() {
                return false;
            }
            self.buf.outbound.extend_from_slice(buf);
            true
        }

        fn close(&mut self) {
            if self.stream.take().is_some() {
                self.buf.fire_close();
            }
        }

        fn is_closed(&self) -> bool {
            self.stream.is_none()
        }

        fn set_close_hook(&mut self, hook: CloseHook) {
            self.buf.close_hook = Some(hook);
        }
    };
}

pub struct TcpServerTransport {
    listener: TcpListener,
    stream: Option<TcpStream>,
    buf: StreamBuf,
}

impl TcpServerTransport {
    pub fn bind(host: &str, port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            stream: None,
            buf: StreamBuf::new(),
        })
    }
}

impl Transport for TcpServerTransport {
    socket_transport_common!();

    fn update(&mut self, timeout: Duration) {
        loop {
            match self.listener.accept() {
                Ok((client, _)) => {
                    if self.stream.is_some() {
                        // One client per session; reject the newcomer.
                        drop(client);
                        continue;
                    }
                    if client.set_nonblocking(true).is_ok() {
                        client.set_nodelay(true).ok();
                        self.stream = Some(client);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        let mut lost = false;
        if let Some(stream) = self.stream.as_mut() {
            lost = !self.buf.pump(stream);
        }
        if lost {
            self.stream = None;
            self.buf.fire_close();
        }

        if !timeout.is_zero() && self.buf.inbound.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }
    }

    fn get_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

pub struct TcpClientTransport {
    stream: Option<TcpStream>,
    buf: StreamBuf,
}

impl TcpClientTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream: Some(stream),
            buf: StreamBuf::new(),
        })
    }
}

impl Transport for TcpClientTransport {
    socket_transport_common!();

    fn update(&mut self, timeout: Duration) {
        let mut lost = false;
        if let Some(stream) = self.stream.as_mut() {
            lost = !self.buf.pump(stream);
        }
        if lost {
            self.stream = None;
            self.buf.fire_close();
        }
        if !timeout.is_zero() && self.buf.inbound.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }
    }
}

#[cfg(unix)]
pub struct UnixServerTransport {
    listener: UnixListener,
    path: PathBuf,
    stream: Option<UnixStream>,
    buf: StreamBuf,
}

#[cfg(unix)]
impl UnixServerTransport {
    pub fn bind(path: &std::path::Path) -> Result<Self, TransportError> {
        // A previous run may have left the socket file behind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            stream: None,
            buf: StreamBuf::new(),
        })
    }
}

#[cfg(unix)]
impl Transport for UnixServerTransport {
    socket_transport_common!();

    fn update(&mut self, timeout: Duration) {
        loop {
            match self.listener.accept() {
                Ok((client, _)) => {
                    if self.stream.is_some() {
                        drop(client);
                        continue;
                    }
                    if client.set_nonblocking(true).is_ok() {
                        self.stream = Some(client);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        let mut lost = false;
        if let Some(stream) = self.stream.as_mut() {
            lost = !self.buf.pump(stream);
        }
        if lost {
            self.stream = None;
            self.buf.fire_close();
        }
        if !timeout.is_zero() && self.buf.inbound.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }
    }
}

#[cfg(unix)]
impl Drop for UnixServerTransport {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
pub struct UnixClientTransport {
    stream: Option<UnixStream>,
    buf: StreamBuf,
}

#[cfg(unix)]
impl UnixClientTransport {
    pub fn connect(path: &std::path::Path) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: Some(stream),
            buf: StreamBuf::new(),
        })
    }
}

#[cfg(unix)]
impl Transport for UnixClientTransport {
    socket_transport_common!();

    fn update(&mut self, timeout: Duration) {
        let mut lost = false;
        if let Some(stream) = self.stream.as_mut() {
            lost = !self.buf.pump(stream);
        }
        if lost {
            self.stream = None;
            self.buf.fire_close();
        }
        if !timeout.is_zero() && self.buf.inbound.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }
    }
}

/// An in-memory transport pair for tests: bytes sent on one end become
/// readable on the other, with no framing of its own.
pub fn pipe() -> (PipeTransport, PipeTransport) {
    let a_to_b = Arc::new(Mutex::new(Vec::new()));
    let b_to_a = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));

    let a = PipeTransport {
        rx: b_to_a.clone(),
        tx: a_to_b.clone(),
        closed: closed.clone(),
        close_seen: false,
        close_hook: None,
    };
    let b = PipeTransport {
        rx: a_to_b,
        tx: b_to_a,
        closed,
        close_seen: false,
        close_hook: None,
    };
    (a, b)
}

pub struct PipeTransport {
    rx: Arc<Mutex<Vec<u8>>>,
    tx: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    close_seen: bool,
    close_hook: Option<CloseHook>,
}

impl PipeTransport {
    /// Bytes written by the peer and not yet consumed, without draining.
    pub fn peer_output(&self) -> Vec<u8> {
        self.rx.lock().clone()
    }
}

impl Transport for PipeTransport {
    fn peek(&mut self) -> usize {
        self.rx.lock().len()
    }

    fn recv(&mut self, buf: &mut [u8]) -> bool {
        let mut rx = self.rx.lock();
        if rx.len() < buf.len() {
            return false;
        }
        buf.copy_from_slice(&rx[..buf.len()]);
        rx.drain(..buf.len());
        true
    }

    fn send(&mut self, buf: &[u8]) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.lock().extend_from_slice(buf);
        true
    }

    fn update(&mut self, _timeout: Duration) {
        if self.closed.load(Ordering::SeqCst) && !self.close_seen {
            self.close_seen = true;
            if let Some(hook) = self.close_hook.as_mut() {
                hook();
            }
        }
    }

    fn close(&mut self) {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        if !was_closed && !self.close_seen {
            self.close_seen = true;
            if let Some(hook) = self.close_hook.as_mut() {
                hook();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_close_hook(&mut self, hook: CloseHook) {
        self.close_hook = Some(hook);
    }
}
