//! Thread-per-connection server: lifecycle, accept loop and session dispatch.
//!
//! ```text
//!            serve()                      stop() / fatal accept error
//!   Idle ───────────▶ Listening ─────────────────────────────▶ Draining
//!    ▲                    │ accept()                                 │
//!    │                    ▼                                          │
//!    │        WorkerSubmitter::submit(ConnectionSession)             │
//!    │                                                               │
//!    └──────────── listener closed, stop flag cleared ◀──────────────┘
//! ```
//!
//! One control thread (the caller of [`ThreadPoolServer::serve`]) blocks in
//! `accept`. Every accepted connection becomes a [`ConnectionSession`] that runs
//! on the worker pool, pinned to one worker until the connection ends.
//! [`ServerHandle::stop`] bumps a stop generation, flips a shared flag and closes
//! the listening transport, which unblocks `accept`. The flag is cleared once the
//! listener is closed so the server can serve again; sessions compare the
//! generation they were dispatched under, so they still observe the stop between
//! requests and finish on their own.

pub mod config;
pub mod session;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use lock_freedom::map::Map as LockfreeMap;

use crate::{
    error::{Result, ServerError, TransportError},
    net::{
        codec::{LineProtocolFactory, ProtocolFactory},
        traits::{ConnectionId, LogLevel, Logger, ProcessorFactory, ServerEventHooks},
        transport::{BufferedTransportFactory, Connection, ServerTransport, TransportFactory},
    },
    thread_pool::{WorkKind, WorkerPool, WorkerSubmitter},
};
use config::{ServerConfig, WorkerBounds};
pub use session::{Collaborators, ConnectionSession};

/// Serializes worker-pool bound changes across every server in the process.
///
/// The pool is process-global, so two servers configuring it at once must not
/// interleave their read-modify-write sequences.
static POOL_CONFIG_LOCK: Mutex<()> = Mutex::new(());

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Externally visible lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Idle = 0,
    Listening = 1,
    Draining = 2,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Listening,
            2 => Self::Draining,
            _ => Self::Idle,
        }
    }
}

/// Point-in-time counters for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub accepted: u64,
    /// Accept calls that failed for reasons other than shutdown. Informational only.
    pub accept_failures: u64,
    pub active_sessions: u64,
    pub completed_sessions: u64,
    pub unexpected_errors: u64,
    pub release_failures: u64,
}

/// A connection currently being served.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
    pub started: Instant,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    accept_failures: AtomicU64,
    completed_sessions: AtomicU64,
    unexpected_errors: AtomicU64,
    release_failures: AtomicU64,
}

struct Shared {
    transport: Arc<dyn ServerTransport>,
    logger: Arc<dyn Logger>,
    stop_requested: AtomicBool,
    stop_generation: AtomicU64,
    state: AtomicU8,
    serving: AtomicBool,
    next_conn_id: AtomicU64,
    sessions: LockfreeMap<u64, SessionInfo>,
    counters: Counters,
}

/// Cloneable reference to a running server.
///
/// Handed to every [`ProcessorFactory`] call so processors can inspect or stop
/// the server that owns them.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    fn new(transport: Arc<dyn ServerTransport>, logger: Arc<dyn Logger>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                logger,
                stop_requested: AtomicBool::new(false),
                stop_generation: AtomicU64::new(0),
                state: AtomicU8::new(ServerState::Idle as u8),
                serving: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
                sessions: LockfreeMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Requests shutdown and closes the listening transport so a blocked accept
    /// returns promptly. In-flight sessions finish their current request and then
    /// end.
    pub fn stop(&self) {
        self.shared.stop_generation.fetch_add(1, Ordering::SeqCst);
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.transport.close() {
            self.log(
                LogLevel::Error,
                &format!("Error closing listening transport: {}", e),
            );
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.local_addr()
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            accept_failures: c.accept_failures.load(Ordering::Relaxed),
            active_sessions: self.active_session_count() as u64,
            completed_sessions: c.completed_sessions.load(Ordering::SeqCst),
            unexpected_errors: c.unexpected_errors.load(Ordering::Relaxed),
            release_failures: c.release_failures.load(Ordering::Relaxed),
        }
    }

    pub fn active_connections(&self) -> Vec<SessionInfo> {
        self.shared
            .sessions
            .iter()
            .map(|entry| entry.val().clone())
            .collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.shared.sessions.iter().count()
    }

    /// Waits until no session is active. Returns `false` if `timeout` elapsed
    /// first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_session_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Number of `stop` calls so far.
    pub(crate) fn stop_generation(&self) -> u64 {
        self.shared.stop_generation.load(Ordering::SeqCst)
    }

    fn clear_stop_request(&self) {
        self.shared.stop_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn logger(&self) -> Arc<dyn Logger> {
        Arc::clone(&self.shared.logger)
    }

    pub(crate) fn track_session(
        &self,
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
    ) -> SessionTracker {
        self.shared.sessions.insert(
            id.as_u64(),
            SessionInfo {
                id,
                peer_addr,
                started: Instant::now(),
            },
        );
        SessionTracker {
            id,
            server: self.clone(),
        }
    }

    pub(crate) fn record_unexpected_error(&self) {
        self.shared
            .counters
            .unexpected_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release_failures(&self, failures: usize) {
        self.shared
            .counters
            .release_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    fn set_state(&self, state: ServerState) {
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.shared.logger.log(level, message);
    }
}

/// Removes a session from the live registry when it ends.
pub(crate) struct SessionTracker {
    id: ConnectionId,
    server: ServerHandle,
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        let shared = &self.server.shared;
        // counted before removal so an idle registry implies an up-to-date count
        shared
            .counters
            .completed_sessions
            .fetch_add(1, Ordering::SeqCst);
        shared.sessions.remove(&self.id.as_u64());
    }
}

struct ServingGuard<'a>(&'a AtomicBool);

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Accepts connections on one control thread and serves each of them on a
/// worker from a shared pool.
///
/// ## Example
///
/// ```rust,no_run
/// use mill_rpc::error::ProcessError;
/// use mill_rpc::net::codec::Codec;
/// use mill_rpc::net::traits::{Processor, ProcessorFactory};
/// use mill_rpc::net::transport::{Connection, TcpServerTransport};
/// use mill_rpc::server::{ServerHandle, ThreadPoolServer};
/// use std::sync::Arc;
///
/// struct Echo;
///
/// impl Processor for Echo {
///     fn process(&mut self, input: &mut dyn Codec, output: &mut dyn Codec)
///         -> Result<bool, ProcessError> {
///         match input.read_message()? {
///             Some(line) => {
///                 output.write_message(&line)?;
///                 output.flush()?;
///                 Ok(true)
///             }
///             None => Ok(false),
///         }
///     }
/// }
///
/// struct EchoFactory;
///
/// impl ProcessorFactory for EchoFactory {
///     fn processor(&self, _: &Arc<dyn Connection>, _: &ServerHandle)
///         -> Result<Box<dyn Processor>, ProcessError> {
///         Ok(Box::new(Echo))
///     }
/// }
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(TcpServerTransport::new("127.0.0.1:9090".parse()?));
/// let server = ThreadPoolServer::builder(transport, Arc::new(EchoFactory)).build()?;
///
/// let handle = server.handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(5));
///     handle.stop();
/// });
///
/// server.serve()?; // blocks until stopped
/// # Ok(())
/// # }
/// ```
pub struct ThreadPoolServer {
    handle: ServerHandle,
    collaborators: Arc<Collaborators>,
    hooks: RwLock<Option<Arc<dyn ServerEventHooks>>>,
    pool: Arc<dyn WorkerSubmitter>,
    work_kind: WorkKind,
}

impl ThreadPoolServer {
    pub fn builder(
        transport: Arc<dyn ServerTransport>,
        processor: Arc<dyn ProcessorFactory>,
    ) -> ServerBuilder {
        ServerBuilder::new(transport, processor)
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn set_event_hooks(&self, hooks: Option<Arc<dyn ServerEventHooks>>) {
        *self.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    pub fn event_hooks(&self) -> Option<Arc<dyn ServerEventHooks>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Listens on the transport and accepts connections until [`stop`](Self::stop)
    /// is called.
    ///
    /// A listen failure is logged and returned without entering the accept loop.
    /// After the loop exits the transport is closed and the stop flag cleared, so
    /// `serve` may be called again.
    pub fn serve(&self) -> Result<()> {
        let shared = &self.handle.shared;
        if shared.serving.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyServing);
        }
        let _serving = ServingGuard(&shared.serving);
        let generation = self.handle.stop_generation();

        if let Err(e) = shared.transport.listen() {
            self.handle
                .log(LogLevel::Error, &format!("Error listening on transport: {}", e));
            return Err(ServerError::Listen(e));
        }

        if let Some(hooks) = self.event_hooks() {
            hooks.pre_serve();
        }

        self.handle.set_state(ServerState::Listening);
        match self.handle.local_addr() {
            Some(addr) => self
                .handle
                .log(LogLevel::Info, &format!("Server listening on {}", addr)),
            None => self.handle.log(LogLevel::Info, "Server listening"),
        }

        self.accept_loop(generation);

        self.handle.set_state(ServerState::Draining);
        if let Err(e) = shared.transport.close() {
            self.handle.log(
                LogLevel::Error,
                &format!("Error closing listening transport: {}", e),
            );
        }
        self.handle.clear_stop_request();
        self.handle.set_state(ServerState::Idle);
        self.handle.log(LogLevel::Info, "Server stopped accepting");
        Ok(())
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    fn accept_loop(&self, generation: u64) {
        let shared = &self.handle.shared;
        let mut consecutive_failures = 0u32;
        while !self.handle.is_stop_requested() {
            match shared.transport.accept() {
                Ok(connection) => {
                    consecutive_failures = 0;
                    self.dispatch(connection, generation);
                }
                // closing the listener is how stop() wakes this thread
                Err(e)
                    if self.handle.is_stop_requested()
                        && (e.is_interrupted() || matches!(e, TransportError::NotOpen)) => {}
                Err(TransportError::NotOpen) => {
                    shared
                        .counters
                        .accept_failures
                        .fetch_add(1, Ordering::Relaxed);
                    self.handle.log(
                        LogLevel::Error,
                        "Listening transport closed unexpectedly; leaving accept loop",
                    );
                    break;
                }
                Err(e) => {
                    shared
                        .counters
                        .accept_failures
                        .fetch_add(1, Ordering::Relaxed);
                    self.handle
                        .log(LogLevel::Error, &format!("Accept error: {}", e));
                    // persistent failures such as EMFILE would otherwise spin
                    std::thread::sleep(accept_backoff(consecutive_failures));
                    consecutive_failures = consecutive_failures.saturating_add(1);
                }
            }
        }
    }

    fn dispatch(&self, connection: Arc<dyn Connection>, generation: u64) {
        let shared = &self.handle.shared;
        let id = ConnectionId::new(shared.next_conn_id.fetch_add(1, Ordering::SeqCst));
        shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
        if let Some(peer) = connection.peer_addr() {
            self.handle.log(
                LogLevel::Debug,
                &format!("New connection: {} (id: {:?})", peer, id),
            );
        }

        let session = ConnectionSession::new(
            id,
            Arc::clone(&connection),
            Arc::clone(&self.collaborators),
            self.event_hooks(),
            self.handle.clone(),
        )
        .with_stop_generation(generation);
        let submitted = self.pool.submit(
            self.work_kind,
            Box::new(move || {
                session.run();
            }),
        );

        if let Err(e) = submitted {
            self.handle.log(
                LogLevel::Error,
                &format!("Failed to schedule connection {:?}: {}", id, e),
            );
            if let Err(e) = connection.close() {
                self.handle.log(
                    LogLevel::Debug,
                    &format!("Error closing unscheduled connection {:?}: {}", id, e),
                );
            }
        }
    }
}

/// Builder for [`ThreadPoolServer`].
///
/// Transport and protocol factories default to [`BufferedTransportFactory`] and
/// [`LineProtocolFactory`] on both sides; the worker pool defaults to
/// [`WorkerPool::global`].
pub struct ServerBuilder {
    transport: Arc<dyn ServerTransport>,
    processor: Arc<dyn ProcessorFactory>,
    input_transport: Option<Arc<dyn TransportFactory>>,
    output_transport: Option<Arc<dyn TransportFactory>>,
    input_protocol: Option<Arc<dyn ProtocolFactory>>,
    output_protocol: Option<Arc<dyn ProtocolFactory>>,
    hooks: Option<Arc<dyn ServerEventHooks>>,
    pool: Option<Arc<dyn WorkerSubmitter>>,
    config: ServerConfig,
}

impl ServerBuilder {
    fn new(transport: Arc<dyn ServerTransport>, processor: Arc<dyn ProcessorFactory>) -> Self {
        Self {
            transport,
            processor,
            input_transport: None,
            output_transport: None,
            input_protocol: None,
            output_protocol: None,
            hooks: None,
            pool: None,
            config: ServerConfig::default(),
        }
    }

    /// Use the same transport factory for input and output streams
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.input_transport = Some(Arc::clone(&factory));
        self.output_transport = Some(factory);
        self
    }

    pub fn input_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.input_transport = Some(factory);
        self
    }

    pub fn output_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.output_transport = Some(factory);
        self
    }

    /// Use the same protocol factory for input and output codecs
    pub fn protocol_factory(mut self, factory: Arc<dyn ProtocolFactory>) -> Self {
        self.input_protocol = Some(Arc::clone(&factory));
        self.output_protocol = Some(factory);
        self
    }

    pub fn input_protocol_factory(mut self, factory: Arc<dyn ProtocolFactory>) -> Self {
        self.input_protocol = Some(factory);
        self
    }

    pub fn output_protocol_factory(mut self, factory: Arc<dyn ProtocolFactory>) -> Self {
        self.output_protocol = Some(factory);
        self
    }

    pub fn event_hooks(mut self, hooks: Arc<dyn ServerEventHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn worker_pool(mut self, pool: Arc<dyn WorkerSubmitter>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Applies the configured worker bounds and builds the server.
    ///
    /// ## Errors
    ///
    /// Returns [`ServerError::Configuration`] if the pool rejects a bound.
    pub fn build(self) -> Result<ThreadPoolServer> {
        let pool = self
            .pool
            .unwrap_or_else(|| WorkerPool::global() as Arc<dyn WorkerSubmitter>);
        configure_pool(pool.as_ref(), &self.config.worker_bounds)?;

        let buffered = || Arc::new(BufferedTransportFactory::default()) as Arc<dyn TransportFactory>;
        let lines = || Arc::new(LineProtocolFactory::default()) as Arc<dyn ProtocolFactory>;
        let collaborators = Collaborators {
            input_transport: self.input_transport.unwrap_or_else(buffered),
            output_transport: self.output_transport.unwrap_or_else(buffered),
            input_protocol: self.input_protocol.unwrap_or_else(lines),
            output_protocol: self.output_protocol.unwrap_or_else(lines),
            processor: self.processor,
        };

        Ok(ThreadPoolServer {
            handle: ServerHandle::new(self.transport, self.config.logger),
            collaborators: Arc::new(collaborators),
            hooks: RwLock::new(self.hooks),
            pool,
            work_kind: self.config.work_kind,
        })
    }
}

/// Applies `bounds` to `pool`: maximums first, then minimums, so a raised
/// minimum never meets a stale lower maximum.
pub fn configure_pool(pool: &dyn WorkerSubmitter, bounds: &WorkerBounds) -> Result<()> {
    if bounds.is_unchanged() {
        return Ok(());
    }
    let _config_guard = POOL_CONFIG_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let current = pool.bounds();

    if bounds.max_workers > 0 || bounds.max_io_workers > 0 {
        let workers = pick(bounds.max_workers, current.max_workers);
        let io_workers = pick(bounds.max_io_workers, current.max_io_workers);
        pool.set_max_workers(workers, io_workers)
            .map_err(|source| ServerError::Configuration {
                message: format!("cannot set maximum workers to {workers}/{io_workers}"),
                source,
            })?;
    }

    if bounds.min_workers > 0 || bounds.min_io_workers > 0 {
        let workers = pick(bounds.min_workers, current.min_workers);
        let io_workers = pick(bounds.min_io_workers, current.min_io_workers);
        pool.set_min_workers(workers, io_workers)
            .map_err(|source| ServerError::Configuration {
                message: format!("cannot set minimum workers to {workers}/{io_workers}"),
                source,
            })?;
    }
    Ok(())
}

/// Delay after the `failures`-th consecutive accept error: doubles from
/// `ACCEPT_BACKOFF_BASE` up to `ACCEPT_BACKOFF_MAX`.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1u32 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

fn pick(requested: i32, current: usize) -> usize {
    if requested > 0 {
        requested as usize
    } else {
        current
    }
}
