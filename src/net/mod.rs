//! Collaborator interfaces consumed by the server, plus TCP and line-based
//! implementations of them.
//!
//! The server owns none of the wire protocol. Every accepted connection is turned
//! into request processing through a chain of factories:
//!
//! ```text
//! ┌──────────────────┐ accept ┌──────────────┐
//! │ ServerTransport  │──────▶│  Connection  │
//! └──────────────────┘        └──────┬───────┘
//!                                    │ TransportFactory (input, output)
//!                                    ▼
//!                             ┌──────────────┐
//!                             │    Stream    │  byte streams
//!                             └──────┬───────┘
//!                                    │ ProtocolFactory (input, output)
//!                                    ▼
//!                             ┌──────────────┐       ┌─────────────┐
//!                             │    Codec     │─────▶│  Processor  │
//!                             └──────────────┘       └─────────────┘
//!                                                  ProcessorFactory
//! ```
//!
//! Implementations shipped here:
//! - [`transport::TcpServerTransport`] / [`transport::TcpConnection`]: blocking TCP
//!   with an accept that [`transport::ServerTransport::close`] can interrupt.
//! - [`transport::BufferedStream`]: buffered reads and writes with a non-consuming peek.
//! - [`codec::LineCodec`]: newline-delimited messages.
//!
//! # Example
//!
//! ```rust
//! use mill_rpc::error::ProcessError;
//! use mill_rpc::net::codec::Codec;
//! use mill_rpc::net::traits::Processor;
//!
//! struct Upper;
//!
//! impl Processor for Upper {
//!     fn process(
//!         &mut self,
//!         input: &mut dyn Codec,
//!         output: &mut dyn Codec,
//!     ) -> Result<bool, ProcessError> {
//!         let Some(line) = input.read_message()? else {
//!             return Ok(false);
//!         };
//!         output.write_message(&line.to_ascii_uppercase())?;
//!         output.flush()?;
//!         Ok(true)
//!     }
//! }
//! ```

pub mod codec;
pub mod traits;
pub mod transport;
