//! Listening transports, accepted connections and the byte streams layered on them.
//!
//! ```text
//!   ServerTransport::accept()
//!          │
//!          ▼
//!   Arc<dyn Connection> ──TransportFactory──▶ Arc<dyn Stream> (input)
//!          │            ──TransportFactory──▶ Arc<dyn Stream> (output)
//!          ▼
//!   Connection::secure_handshake()  (optional capability)
//! ```
//!
//! [`TcpServerTransport`] blocks in `accept` on a mio poll that also carries a
//! waker, so [`ServerTransport::close`] from another thread unblocks a pending
//! accept with [`TransportError::Interrupted`].

use std::{
    io::{self, Read, Write},
    net::{self, Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
};

use mio::{net::TcpListener, Events, Interest, Poll, Token, Waker};

use crate::error::TransportError;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const EVENTS_CAPACITY: usize = 64;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// A listening endpoint that hands out accepted connections.
///
/// `accept` blocks the calling thread. `close` may be called from any thread and
/// must make a blocked `accept` return [`TransportError::Interrupted`] promptly.
pub trait ServerTransport: Send + Sync {
    fn listen(&self) -> Result<(), TransportError>;

    fn accept(&self) -> Result<Arc<dyn Connection>, TransportError>;

    fn close(&self) -> Result<(), TransportError>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Raw accepted connection.
pub trait Connection: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write_all(&self, buf: &[u8]) -> Result<(), TransportError>;

    fn flush(&self) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Returns the handshake capability when the connection must be secured
    /// before carrying protocol traffic.
    fn secure_handshake(&self) -> Option<&dyn SecureHandshake> {
        None
    }
}

/// Capability of connections that need a handshake before first use.
pub trait SecureHandshake {
    fn handshake(&self) -> Result<(), TransportError>;
}

/// Byte stream wrapper over a connection.
pub trait Stream: Send + Sync {
    fn is_open(&self) -> bool;

    /// Blocks until data is available or the peer closes.
    ///
    /// Returns `Ok(false)` on a clean end of stream or when the stream is closed.
    fn peek(&self) -> Result<bool, TransportError>;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write_all(&self, buf: &[u8]) -> Result<(), TransportError>;

    fn flush(&self) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}

pub trait TransportFactory: Send + Sync + 'static {
    fn stream(&self, connection: Arc<dyn Connection>) -> Result<Arc<dyn Stream>, TransportError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Listening {
    poll: Poll,
    events: Events,
    listener: TcpListener,
}

/// TCP listener whose blocking accept can be interrupted from another thread.
pub struct TcpServerTransport {
    address: SocketAddr,
    no_delay: bool,
    listening: Mutex<Option<Listening>>,
    waker: Mutex<Option<Arc<Waker>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl TcpServerTransport {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            no_delay: true,
            listening: Mutex::new(None),
            waker: Mutex::new(None),
            local_addr: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Enable or disable TCP_NODELAY on accepted connections
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    fn wrap(&self, stream: mio::net::TcpStream, peer: SocketAddr) -> io::Result<TcpConnection> {
        let stream = net::TcpStream::from(stream);
        stream.set_nonblocking(false)?;
        stream.set_nodelay(self.no_delay)?;
        Ok(TcpConnection::new(stream, peer))
    }
}

impl ServerTransport for TcpServerTransport {
    fn listen(&self) -> Result<(), TransportError> {
        let mut listening = lock(&self.listening);
        if listening.is_some() {
            return Ok(());
        }

        let mut listener = TcpListener::bind(self.address)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        *lock(&self.local_addr) = Some(listener.local_addr()?);
        *lock(&self.waker) = Some(Arc::new(waker));
        *listening = Some(Listening {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
        });
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let mut guard = lock(&self.listening);
        loop {
            let Some(listening) = guard.as_mut() else {
                return Err(TransportError::NotOpen);
            };
            if self.closed.load(Ordering::SeqCst) {
                *guard = None;
                return Err(TransportError::Interrupted);
            }

            // mio is edge-triggered: drain pending connections before polling again
            match listening.listener.accept() {
                Ok((stream, peer)) => return Ok(Arc::new(self.wrap(stream, peer)?)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            match listening.poll.poll(&mut listening.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let waker = lock(&self.waker).clone();
        if let Some(waker) = waker {
            waker.wake()?;
        }

        // A thread blocked in accept holds the listener and drops it on wake-up.
        match self.listening.try_lock() {
            Ok(mut listening) => *listening = None,
            Err(TryLockError::Poisoned(poisoned)) => *poisoned.into_inner() = None,
            Err(TryLockError::WouldBlock) => {}
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }
}

/// Blocking TCP connection produced by [`TcpServerTransport`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

impl TcpConnection {
    pub fn new(stream: net::TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            closed: AtomicBool::new(false),
        }
    }
}

impl Connection for TcpConnection {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            match (&self.stream).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return Ok(result?),
            }
        }
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), TransportError> {
        Ok((&self.stream).write_all(buf)?)
    }

    fn flush(&self) -> Result<(), TransportError> {
        Ok((&self.stream).flush()?)
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }
}

struct ReadBuffer {
    data: Box<[u8]>,
    pos: usize,
    filled: usize,
}

impl ReadBuffer {
    fn buffered(&self) -> &[u8] {
        &self.data[self.pos..self.filled]
    }
}

/// Buffered stream over a shared connection.
///
/// Reads are served from an internal buffer so `peek` can wait for data without
/// consuming it. Writes accumulate until `flush` or until the buffer fills.
pub struct BufferedStream {
    connection: Arc<dyn Connection>,
    read_buf: Mutex<ReadBuffer>,
    write_buf: Mutex<Vec<u8>>,
    capacity: usize,
    open: AtomicBool,
}

impl BufferedStream {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self::with_capacity(connection, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(connection: Arc<dyn Connection>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            connection,
            read_buf: Mutex::new(ReadBuffer {
                data: vec![0; capacity].into_boxed_slice(),
                pos: 0,
                filled: 0,
            }),
            write_buf: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            open: AtomicBool::new(true),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }

    fn fill(&self, buf: &mut ReadBuffer) -> Result<usize, TransportError> {
        let n = self.connection.read(&mut buf.data)?;
        buf.pos = 0;
        buf.filled = n;
        Ok(n)
    }

    fn flush_pending(&self) -> Result<(), TransportError> {
        let pending = std::mem::take(&mut *lock(&self.write_buf));
        if !pending.is_empty() {
            self.connection.write_all(&pending)?;
        }
        self.connection.flush()
    }
}

impl Stream for BufferedStream {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn peek(&self) -> Result<bool, TransportError> {
        if !self.is_open() {
            return Ok(false);
        }
        let mut buf = lock(&self.read_buf);
        if !buf.buffered().is_empty() {
            return Ok(true);
        }
        Ok(self.fill(&mut buf)? > 0)
    }

    fn read(&self, out: &mut [u8]) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let mut buf = lock(&self.read_buf);
        if buf.buffered().is_empty() {
            if out.len() >= self.capacity {
                return self.connection.read(out);
            }
            if self.fill(&mut buf)? == 0 {
                return Ok(0);
            }
        }
        let n = buf.buffered().len().min(out.len());
        out[..n].copy_from_slice(&buf.buffered()[..n]);
        buf.pos += n;
        Ok(n)
    }

    fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let full = {
            let mut buf = lock(&self.write_buf);
            buf.extend_from_slice(data);
            buf.len() >= self.capacity
        };
        if full {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.flush_pending()
    }

    fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let flushed = if lock(&self.write_buf).is_empty() {
            Ok(())
        } else {
            self.flush_pending()
        };
        let closed = self.connection.close();
        flushed.and(closed)
    }
}

/// Wraps every connection in a [`BufferedStream`].
#[derive(Debug, Clone)]
pub struct BufferedTransportFactory {
    capacity: usize,
}

impl BufferedTransportFactory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for BufferedTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl TransportFactory for BufferedTransportFactory {
    fn stream(&self, connection: Arc<dyn Connection>) -> Result<Arc<dyn Stream>, TransportError> {
        Ok(Arc::new(BufferedStream::with_capacity(
            connection,
            self.capacity,
        )))
    }
}
