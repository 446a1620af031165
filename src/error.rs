use std::io;

use thiserror::Error;

use crate::thread_pool::WorkKind;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Failures raised by listening transports, connections and byte streams.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A blocking accept was woken because the listener is being closed.
    #[error("accept interrupted")]
    Interrupted,
    #[error("transport is not open")]
    NotOpen,
    #[error("end of stream")]
    EndOfStream,
    #[error("secure handshake failed: {0}")]
    Handshake(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_interrupted(&self) -> bool {
        match self {
            TransportError::Interrupted => true,
            TransportError::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// Whether this error means the peer went away rather than something broke.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::NotOpen | TransportError::EndOfStream => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Failures reported by a processor while serving a single request.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("handler error: {0}")]
    Handler(String),
    #[error("panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProcessError::Transport(e) if e.is_disconnect())
    }
}

impl From<io::Error> for ProcessError {
    fn from(err: io::Error) -> Self {
        ProcessError::Transport(TransportError::Io(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("{kind:?} lane: maximum of {max} workers is below the minimum of {min}")]
    InvalidBounds { kind: WorkKind, min: usize, max: usize },
    #[error("{0:?} lane: maximum worker count must be positive")]
    ZeroWorkers(WorkKind),
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("no worker available and spawning one failed: {0}")]
    Spawn(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: PoolError,
    },
    #[error("listen failed: {0}")]
    Listen(#[source] TransportError),
    #[error("server is already serving")]
    AlreadyServing,
}

/// Outcome classification for a connection session that did not end cleanly.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport disconnected: {0}")]
    TransportDisconnect(#[source] ProcessError),
    #[error("unexpected processing error: {0}")]
    UnexpectedProcessing(#[source] ProcessError),
    #[error("failed to release {resource}: {source}")]
    ResourceRelease {
        resource: &'static str,
        #[source]
        source: TransportError,
    },
}

impl SessionError {
    /// Splits a processing failure into the expected and reported classes.
    pub fn classify(err: ProcessError) -> Self {
        if err.is_disconnect() {
            SessionError::TransportDisconnect(err)
        } else {
            SessionError::UnexpectedProcessing(err)
        }
    }

    pub fn is_reportable(&self) -> bool {
        !matches!(self, SessionError::TransportDisconnect(_))
    }
}
