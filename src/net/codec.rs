//! Message codecs layered over byte streams.

use std::sync::Arc;

use crate::{
    error::{ProcessError, TransportError},
    net::transport::Stream,
};

/// Message encode/decode layer over a [`Stream`].
///
/// Messages are opaque byte payloads; framing is up to the implementation.
pub trait Codec: Send {
    /// Reads the next message. `Ok(None)` means the peer closed the stream
    /// cleanly between messages.
    fn read_message(&mut self) -> Result<Option<Vec<u8>>, ProcessError>;

    fn write_message(&mut self, message: &[u8]) -> Result<(), ProcessError>;

    fn flush(&mut self) -> Result<(), ProcessError>;

    /// Releases codec state. The underlying stream is released separately.
    fn close(&mut self) -> Result<(), TransportError>;

    fn stream(&self) -> &Arc<dyn Stream>;
}

pub trait ProtocolFactory: Send + Sync + 'static {
    fn codec(&self, stream: Arc<dyn Stream>) -> Result<Box<dyn Codec>, TransportError>;
}

/// Newline-delimited messages. A trailing `\r` is stripped on read.
pub struct LineCodec {
    stream: Arc<dyn Stream>,
    max_length: usize,
    closed: bool,
}

impl LineCodec {
    pub fn new(stream: Arc<dyn Stream>) -> Self {
        Self::with_max_length(stream, usize::MAX)
    }

    pub fn with_max_length(stream: Arc<dyn Stream>, max_length: usize) -> Self {
        Self {
            stream,
            max_length,
            closed: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Codec for LineCodec {
    fn read_message(&mut self) -> Result<Option<Vec<u8>>, ProcessError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.stream.read(&mut byte)? == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::EndOfStream.into());
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() == self.max_length {
                return Err(ProcessError::Codec(format!(
                    "line exceeds maximum length of {}",
                    self.max_length
                )));
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn write_message(&mut self, message: &[u8]) -> Result<(), ProcessError> {
        if message.contains(&b'\n') {
            return Err(ProcessError::Codec("message contains a newline".into()));
        }
        self.stream.write_all(message)?;
        self.stream.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ProcessError> {
        Ok(self.stream.flush()?)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) || !self.stream.is_open() {
            return Ok(());
        }
        self.stream.flush()
    }

    fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }
}

#[derive(Debug, Clone)]
pub struct LineProtocolFactory {
    max_length: usize,
}

impl LineProtocolFactory {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Default for LineProtocolFactory {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl ProtocolFactory for LineProtocolFactory {
    fn codec(&self, stream: Arc<dyn Stream>) -> Result<Box<dyn Codec>, TransportError> {
        Ok(Box::new(LineCodec::with_max_length(stream, self.max_length)))
    }
}
