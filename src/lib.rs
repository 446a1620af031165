//! # Mill-RPC
//! The server core of a thread-per-connection RPC framework: a blocking accept loop,
//! dispatch of every accepted connection onto an elastic worker pool, and a
//! connection lifecycle that always releases what it acquired.
//!
//! Mill-RPC owns no wire protocol. Transports, codecs and request processors are
//! pluggable collaborators; the crate ships a TCP transport, a buffered stream and
//! a newline-delimited codec so a working server is a few lines away.
//! ## Core Philosophy
//! - **One connection, one worker**: a session runs on the same pool thread from
//!   accept to close, so request handling is plain blocking code
//! - **Cooperative shutdown**: stopping closes the listener and lets in-flight
//!   sessions finish their current request
//! - **Nothing leaks**: every stream and codec is released exactly once, even when
//!   processing fails or panics
//! ## Features
//! - **Interruptible accept** built on [`mio`]'s poll and waker
//! - **Elastic two-lane worker pool** with min/max bounds and idle retirement
//! - **Event hooks** for per-connection context (auth state, tracing spans, ...)
//! - **Structured logging** through [`tracing`], or any [`Logger`](net::traits::Logger)
//! - **Live introspection** of active sessions and lifetime counters
//! ## Architecture Overview
//! ```text
//! ┌──────────────────┐  accept  ┌───────────────────┐ submit ┌──────────────┐
//! │ ThreadPoolServer │────────▶│ ConnectionSession │──────▶│  WorkerPool  │
//! └──────────────────┘          └───────────────────┘        └──────┬───────┘
//!          │                                                        │ run
//!          ▼                                                        ▼
//!  ┌────────────────┐       ┌───────────┐   ┌─────────┐    ┌────────────────┐
//!  │ServerTransport │       │  Stream   │──▶│  Codec  │──▶│   Processor    │
//!  └────────────────┘       └───────────┘   └─────────┘    └────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_rpc::prelude::*;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Processor for Echo {
//!     fn process(
//!         &mut self,
//!         input: &mut dyn Codec,
//!         output: &mut dyn Codec,
//!     ) -> Result<bool, ProcessError> {
//!         let Some(line) = input.read_message()? else {
//!             return Ok(false);
//!         };
//!         output.write_message(&line)?;
//!         output.flush()?;
//!         Ok(true)
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl ProcessorFactory for EchoFactory {
//!     fn processor(
//!         &self,
//!         _connection: &Arc<dyn Connection>,
//!         _server: &ServerHandle,
//!     ) -> Result<Box<dyn Processor>, ProcessError> {
//!         Ok(Box::new(Echo))
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(TcpServerTransport::new("127.0.0.1:9090".parse()?));
//!     let config = ServerConfig::builder().max_io_workers(64).build();
//!     let server = ThreadPoolServer::builder(transport, Arc::new(EchoFactory))
//!         .config(config)
//!         .build()?;
//!
//!     // Blocks until ServerHandle::stop is called from another thread
//!     server.serve()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`server::ThreadPoolServer`]: lifecycle and accept loop
//! - [`server::ConnectionSession`]: per-connection processing and teardown
//! - [`thread_pool`]: the elastic worker pool sessions run on
//! - [`net`]: collaborator traits and the TCP / line-codec implementations
//! - [`error`]: error types and their classification

pub mod error;
pub mod net;
pub mod server;
pub mod thread_pool;

pub use server::{ServerHandle, ThreadPoolServer};
pub use thread_pool::{WorkKind, WorkerPool};

/// Re-exports of the types needed to write and run a server.
///
/// ```rust
/// use mill_rpc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ProcessError, ServerError, TransportError};
    pub use crate::net::codec::{Codec, LineProtocolFactory, ProtocolFactory};
    pub use crate::net::traits::{
        ConnectionContext, ConnectionId, LogLevel, Logger, Processor, ProcessorFactory,
        ServerEventHooks, TracingLogger,
    };
    pub use crate::net::transport::{
        BufferedTransportFactory, Connection, ServerTransport, Stream, TcpServerTransport,
        TransportFactory,
    };
    pub use crate::server::config::{ServerConfig, WorkerBounds};
    pub use crate::server::{ServerHandle, ServerState, ThreadPoolServer};
    pub use crate::thread_pool::{WorkKind, WorkerPool, WorkerSubmitter};
}
