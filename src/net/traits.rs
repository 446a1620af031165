use std::{any::Any, sync::Arc};

use crate::{
    error::ProcessError,
    net::{codec::Codec, transport::Connection, transport::Stream},
    server::ServerHandle,
};

/// Unique identifier for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Handles requests for one connection.
///
/// A processor is created per accepted connection and driven by a single worker
/// thread, one request at a time, until it returns `Ok(false)`, fails, or the
/// input stream reports end of stream.
pub trait Processor: Send {
    /// Reads one request from `input` and writes its response to `output`.
    ///
    /// Blocks until the request/response cycle is complete. `Ok(false)` asks the
    /// server to stop serving this connection; it is not an error.
    fn process(&mut self, input: &mut dyn Codec, output: &mut dyn Codec)
        -> Result<bool, ProcessError>;
}

/// Produces the processor bound to a freshly accepted connection.
pub trait ProcessorFactory: Send + Sync + 'static {
    fn processor(
        &self,
        connection: &Arc<dyn Connection>,
        server: &ServerHandle,
    ) -> Result<Box<dyn Processor>, ProcessError>;
}

/// Per-connection state owned by a [`ServerEventHooks`] implementation.
pub type ConnectionContext = Box<dyn Any + Send>;

/// Observer for server and connection lifecycle events.
///
/// Every method has a no-op default, so implementors only override the points
/// they care about.
pub trait ServerEventHooks: Send + Sync + 'static {
    /// Called once the transport is listening, before the first accept.
    fn pre_serve(&self) {}

    /// Called when a connection's codecs are ready. The returned context is handed
    /// back to [`process_context`](Self::process_context) and
    /// [`delete_context`](Self::delete_context).
    fn create_context(
        &self,
        input: &mut dyn Codec,
        output: &mut dyn Codec,
    ) -> Option<ConnectionContext> {
        let _ = (input, output);
        None
    }

    /// Called before each request is processed, once input is waiting on the
    /// stream.
    fn process_context(&self, context: Option<&mut ConnectionContext>, input: &dyn Stream) {
        let _ = (context, input);
    }

    /// Called once when the request loop exits, before resources are released.
    fn delete_context(
        &self,
        context: Option<ConnectionContext>,
        input: &mut dyn Codec,
        output: &mut dyn Codec,
    ) {
        let _ = (context, input, output);
    }
}

/// Log levels for server events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for server events
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {
        // Do nothing
    }
}

/// Forwards messages to the `tracing` macros under the `mill_rpc` target.
#[derive(Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "mill_rpc", "{message}"),
            LogLevel::Info => tracing::info!(target: "mill_rpc", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "mill_rpc", "{message}"),
            LogLevel::Error => tracing::error!(target: "mill_rpc", "{message}"),
        }
    }
}
