//! Per-connection request processing.
//!
//! ```text
//! handshake? ─▶ input stream ─▶ output stream ─▶ input codec ─▶ output codec
//!                                                                   │
//!        create_context ◀───────────────────────────────────────────┘
//!              │
//!              ▼
//!   ┌──▶ server stopped? ──yes──┐
//!   │          │ no             │
//!   │     peek input ──closed───┤
//!   │          │ data           │
//!   │    process_context        │
//!   │          │                │
//!   └── process() ──false/err───┤
//!                               ▼
//!                        delete_context
//!                               │
//!   release: output codec, input codec, output stream, input stream
//! ```

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    error::{ProcessError, SessionError, TransportError},
    net::{
        codec::{Codec, ProtocolFactory},
        traits::{ConnectionContext, ConnectionId, LogLevel, Logger, ProcessorFactory, ServerEventHooks},
        transport::{Connection, Stream, TransportFactory},
    },
    server::ServerHandle,
};

/// The factory chain that turns an accepted connection into streams, codecs
/// and a processor.
pub struct Collaborators {
    pub input_transport: Arc<dyn TransportFactory>,
    pub output_transport: Arc<dyn TransportFactory>,
    pub input_protocol: Arc<dyn ProtocolFactory>,
    pub output_protocol: Arc<dyn ProtocolFactory>,
    pub processor: Arc<dyn ProcessorFactory>,
}

/// The four resources a session owns, released in reverse acquisition order.
struct SessionResources {
    id: ConnectionId,
    logger: Arc<dyn Logger>,
    input_stream: Option<Arc<dyn Stream>>,
    output_stream: Option<Arc<dyn Stream>>,
    input_codec: Option<Box<dyn Codec>>,
    output_codec: Option<Box<dyn Codec>>,
}

impl SessionResources {
    fn new(id: ConnectionId, logger: Arc<dyn Logger>) -> Self {
        Self {
            id,
            logger,
            input_stream: None,
            output_stream: None,
            input_codec: None,
            output_codec: None,
        }
    }

    fn codecs(&mut self) -> Option<(&mut (dyn Codec + 'static), &mut (dyn Codec + 'static))> {
        match (self.input_codec.as_deref_mut(), self.output_codec.as_deref_mut()) {
            (Some(input), Some(output)) => Some((input, output)),
            _ => None,
        }
    }

    /// Releases whatever was acquired. Returns the number of failed releases.
    fn release(&mut self) -> usize {
        let mut failures = 0;
        if let Some(mut codec) = self.output_codec.take() {
            failures += self.release_one("output codec", move || codec.close());
        }
        if let Some(mut codec) = self.input_codec.take() {
            failures += self.release_one("input codec", move || codec.close());
        }
        if let Some(stream) = self.output_stream.take() {
            failures += self.release_one("output stream", move || stream.close());
        }
        if let Some(stream) = self.input_stream.take() {
            failures += self.release_one("input stream", move || stream.close());
        }
        failures
    }

    fn release_one<F>(&self, resource: &'static str, release: F) -> usize
    where
        F: FnOnce() -> Result<(), TransportError>,
    {
        let source = match panic::catch_unwind(AssertUnwindSafe(release)) {
            Ok(Ok(())) => return 0,
            Ok(Err(e)) => e,
            Err(payload) => TransportError::Io(std::io::Error::other(panic_message(&*payload))),
        };
        let err = SessionError::ResourceRelease { resource, source };
        self.logger
            .log(LogLevel::Error, &format!("Connection {:?}: {}", self.id, err));
        1
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.release();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// One accepted connection's full lifecycle, run once on a worker thread.
pub struct ConnectionSession {
    id: ConnectionId,
    connection: Arc<dyn Connection>,
    collaborators: Arc<Collaborators>,
    hooks: Option<Arc<dyn ServerEventHooks>>,
    server: ServerHandle,
    stop_generation: u64,
}

impl ConnectionSession {
    pub fn new(
        id: ConnectionId,
        connection: Arc<dyn Connection>,
        collaborators: Arc<Collaborators>,
        hooks: Option<Arc<dyn ServerEventHooks>>,
        server: ServerHandle,
    ) -> Self {
        let stop_generation = server.stop_generation();
        Self {
            id,
            connection,
            collaborators,
            hooks,
            server,
            stop_generation,
        }
    }

    /// Ends the session at any `stop` issued after `generation` was current,
    /// even if the server has since cleared its stop flag to serve again.
    pub(crate) fn with_stop_generation(mut self, generation: u64) -> Self {
        self.stop_generation = generation;
        self
    }

    fn stop_requested(&self) -> bool {
        self.server.is_stop_requested() || self.server.stop_generation() != self.stop_generation
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serves the connection until it closes, the processor declines further
    /// work, or the server stops. Never panics and never returns an error to the
    /// caller; the returned value only describes how the session ended.
    pub fn run(self) -> Option<SessionError> {
        let logger = self.server.logger();
        let _tracked = self
            .server
            .track_session(self.id, self.connection.peer_addr());
        let mut resources = SessionResources::new(self.id, logger.clone());
        let mut context: Option<ConnectionContext> = None;
        let mut context_created = false;

        let served = panic::catch_unwind(AssertUnwindSafe(|| {
            self.serve(&mut resources, &mut context, &mut context_created)
        }));
        let outcome = match served {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(SessionError::classify(e)),
            Err(payload) => Some(SessionError::UnexpectedProcessing(ProcessError::Panicked(
                panic_message(&*payload),
            ))),
        };

        if context_created {
            self.delete_context(&mut resources, context.take());
        }

        match &outcome {
            Some(err) if err.is_reportable() => {
                self.server.record_unexpected_error();
                logger.log(
                    LogLevel::Error,
                    &format!("Connection {:?}: {}", self.id, err),
                );
            }
            Some(err) => logger.log(
                LogLevel::Debug,
                &format!("Connection {:?} closed by peer: {}", self.id, err),
            ),
            None => logger.log(
                LogLevel::Debug,
                &format!("Connection {:?} finished", self.id),
            ),
        }

        let failures = resources.release();
        self.server.record_release_failures(failures);
        outcome
    }

    fn serve(
        &self,
        resources: &mut SessionResources,
        context: &mut Option<ConnectionContext>,
        context_created: &mut bool,
    ) -> Result<(), ProcessError> {
        if let Some(secure) = self.connection.secure_handshake() {
            secure.handshake()?;
        }

        let c = &self.collaborators;
        let input = c.input_transport.stream(Arc::clone(&self.connection))?;
        resources.input_stream = Some(Arc::clone(&input));
        let output = c.output_transport.stream(Arc::clone(&self.connection))?;
        resources.output_stream = Some(Arc::clone(&output));
        resources.input_codec = Some(c.input_protocol.codec(Arc::clone(&input))?);
        resources.output_codec = Some(c.output_protocol.codec(output)?);

        let mut processor = c.processor.processor(&self.connection, &self.server)?;
        let Some((input_codec, output_codec)) = resources.codecs() else {
            return Ok(());
        };

        if let Some(hooks) = &self.hooks {
            *context = hooks.create_context(input_codec, output_codec);
            *context_created = true;
        }

        while !self.stop_requested() {
            // a request that arrives after a stop is not served
            if !input.peek()? || self.stop_requested() {
                break;
            }
            if let Some(hooks) = &self.hooks {
                hooks.process_context(context.as_mut(), input.as_ref());
            }
            if !processor.process(input_codec, output_codec)? {
                break;
            }
        }
        Ok(())
    }

    fn delete_context(
        &self,
        resources: &mut SessionResources,
        context: Option<ConnectionContext>,
    ) {
        let (Some(hooks), Some((input, output))) = (&self.hooks, resources.codecs()) else {
            return;
        };
        let deleted = panic::catch_unwind(AssertUnwindSafe(|| {
            hooks.delete_context(context, input, output)
        }));
        if let Err(payload) = deleted {
            self.server.logger().log(
                LogLevel::Error,
                &format!(
                    "Connection {:?}: delete_context panicked: {}",
                    self.id,
                    panic_message(&*payload)
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::net::{
        traits::Processor,
        transport::{SecureHandshake, ServerTransport},
    };

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    fn recorded(events: &Events) -> Vec<String> {
        events.lock().unwrap().clone()
    }

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl RecordingLogger {
        fn errors(&self) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter(|(level, _)| *level == LogLevel::Error)
                .map(|(_, line)| line.clone())
                .collect()
        }
    }

    impl Logger for RecordingLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_owned()));
        }
    }

    struct IdleTransport;

    impl ServerTransport for IdleTransport {
        fn listen(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn accept(&self) -> Result<Arc<dyn Connection>, TransportError> {
            Err(TransportError::NotOpen)
        }

        fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct MockConnection {
        events: Events,
        secure: bool,
    }

    impl Connection for MockConnection {
        fn read(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(0)
        }

        fn write_all(&self, _buf: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn flush(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn secure_handshake(&self) -> Option<&dyn SecureHandshake> {
            if self.secure {
                Some(self)
            } else {
                None
            }
        }
    }

    impl SecureHandshake for MockConnection {
        fn handshake(&self) -> Result<(), TransportError> {
            record(&self.events, "handshake");
            Ok(())
        }
    }

    struct MockStream {
        name: &'static str,
        events: Events,
        peeks: Mutex<VecDeque<Result<bool, io::ErrorKind>>>,
        fail_close: bool,
    }

    impl Stream for MockStream {
        fn is_open(&self) -> bool {
            true
        }

        fn peek(&self) -> Result<bool, TransportError> {
            record(&self.events, format!("peek {}", self.name));
            match self.peeks.lock().unwrap().pop_front() {
                Some(Ok(ready)) => Ok(ready),
                Some(Err(kind)) => Err(io::Error::from(kind).into()),
                None => Ok(false),
            }
        }

        fn read(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(0)
        }

        fn write_all(&self, _buf: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn flush(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&self) -> Result<(), TransportError> {
            record(&self.events, format!("close {}", self.name));
            if self.fail_close {
                Err(io::Error::other("close failed").into())
            } else {
                Ok(())
            }
        }
    }

    struct MockTransportFactory {
        name: &'static str,
        events: Events,
        peeks: Vec<Result<bool, io::ErrorKind>>,
        fail_close: bool,
    }

    impl TransportFactory for MockTransportFactory {
        fn stream(&self, _conn: Arc<dyn Connection>) -> Result<Arc<dyn Stream>, TransportError> {
            record(&self.events, format!("open {}", self.name));
            Ok(Arc::new(MockStream {
                name: self.name,
                events: self.events.clone(),
                peeks: Mutex::new(self.peeks.clone().into()),
                fail_close: self.fail_close,
            }))
        }
    }

    #[derive(Clone, Copy, Default)]
    enum CloseOutcome {
        #[default]
        Clean,
        Fail,
        Panic,
    }

    struct MockCodec {
        name: &'static str,
        events: Events,
        stream: Arc<dyn Stream>,
        on_close: CloseOutcome,
    }

    impl Codec for MockCodec {
        fn read_message(&mut self) -> Result<Option<Vec<u8>>, ProcessError> {
            Ok(None)
        }

        fn write_message(&mut self, _message: &[u8]) -> Result<(), ProcessError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), ProcessError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            record(&self.events, format!("close {}", self.name));
            match self.on_close {
                CloseOutcome::Clean => Ok(()),
                CloseOutcome::Fail => Err(TransportError::NotOpen),
                CloseOutcome::Panic => panic!("codec close bug"),
            }
        }

        fn stream(&self) -> &Arc<dyn Stream> {
            &self.stream
        }
    }

    struct MockProtocolFactory {
        name: &'static str,
        events: Events,
        fail: bool,
        on_close: CloseOutcome,
    }

    impl ProtocolFactory for MockProtocolFactory {
        fn codec(&self, stream: Arc<dyn Stream>) -> Result<Box<dyn Codec>, TransportError> {
            if self.fail {
                return Err(TransportError::Handshake("codec unavailable".into()));
            }
            record(&self.events, format!("open {}", self.name));
            Ok(Box::new(MockCodec {
                name: self.name,
                events: self.events.clone(),
                stream,
                on_close: self.on_close,
            }))
        }
    }

    enum Step {
        Continue,
        Done,
        Fail(fn() -> ProcessError),
        Panic,
        /// Stops the server mid-request, then lets it clear the stop flag the way
        /// `serve` does once its listener is closed.
        StopServer,
    }

    struct ScriptedProcessor {
        events: Events,
        steps: VecDeque<Step>,
        server: ServerHandle,
    }

    impl Processor for ScriptedProcessor {
        fn process(
            &mut self,
            _input: &mut dyn Codec,
            _output: &mut dyn Codec,
        ) -> Result<bool, ProcessError> {
            record(&self.events, "process");
            match self.steps.pop_front().unwrap_or(Step::Done) {
                Step::Continue => Ok(true),
                Step::Done => Ok(false),
                Step::Fail(make) => Err(make()),
                Step::Panic => panic!("processor bug"),
                Step::StopServer => {
                    self.server.stop();
                    self.server.clear_stop_request();
                    Ok(true)
                }
            }
        }
    }

    struct ScriptedProcessorFactory {
        events: Events,
        steps: Mutex<Option<VecDeque<Step>>>,
    }

    impl ProcessorFactory for ScriptedProcessorFactory {
        fn processor(
            &self,
            _connection: &Arc<dyn Connection>,
            server: &ServerHandle,
        ) -> Result<Box<dyn Processor>, ProcessError> {
            Ok(Box::new(ScriptedProcessor {
                events: self.events.clone(),
                steps: self.steps.lock().unwrap().take().unwrap_or_default(),
                server: server.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        created: AtomicUsize,
        processed: AtomicUsize,
        deleted: AtomicUsize,
        saw_context: AtomicUsize,
    }

    impl ServerEventHooks for CountingHooks {
        fn create_context(
            &self,
            _input: &mut dyn Codec,
            _output: &mut dyn Codec,
        ) -> Option<ConnectionContext> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(7u32))
        }

        fn process_context(&self, context: Option<&mut ConnectionContext>, _input: &dyn Stream) {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if context.and_then(|c| c.downcast_ref::<u32>()).is_some() {
                self.saw_context.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn delete_context(
            &self,
            context: Option<ConnectionContext>,
            _input: &mut dyn Codec,
            _output: &mut dyn Codec,
        ) {
            assert!(context.is_some());
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        events: Events,
        logger: Arc<RecordingLogger>,
        hooks: Arc<CountingHooks>,
        server: ServerHandle,
        peeks: Vec<Result<bool, io::ErrorKind>>,
        steps: Vec<Step>,
        secure: bool,
        fail_input_close: bool,
        fail_output_codec: bool,
        input_codec_close: CloseOutcome,
        output_codec_close: CloseOutcome,
    }

    impl Harness {
        fn new() -> Self {
            let logger = Arc::new(RecordingLogger::default());
            Self {
                events: Arc::default(),
                server: ServerHandle::new(Arc::new(IdleTransport), logger.clone()),
                logger,
                hooks: Arc::default(),
                peeks: Vec::new(),
                steps: Vec::new(),
                secure: false,
                fail_input_close: false,
                fail_output_codec: false,
                input_codec_close: CloseOutcome::Clean,
                output_codec_close: CloseOutcome::Clean,
            }
        }

        fn run(mut self) -> (Option<SessionError>, Self) {
            let steps: VecDeque<Step> = std::mem::take(&mut self.steps).into();
            let collaborators = Arc::new(Collaborators {
                input_transport: Arc::new(MockTransportFactory {
                    name: "input stream",
                    events: self.events.clone(),
                    peeks: self.peeks.clone(),
                    fail_close: self.fail_input_close,
                }),
                output_transport: Arc::new(MockTransportFactory {
                    name: "output stream",
                    events: self.events.clone(),
                    peeks: Vec::new(),
                    fail_close: false,
                }),
                input_protocol: Arc::new(MockProtocolFactory {
                    name: "input codec",
                    events: self.events.clone(),
                    fail: false,
                    on_close: self.input_codec_close,
                }),
                output_protocol: Arc::new(MockProtocolFactory {
                    name: "output codec",
                    events: self.events.clone(),
                    fail: self.fail_output_codec,
                    on_close: self.output_codec_close,
                }),
                processor: Arc::new(ScriptedProcessorFactory {
                    events: self.events.clone(),
                    steps: Mutex::new(Some(steps)),
                }),
            });

            let session = ConnectionSession::new(
                ConnectionId::new(1),
                Arc::new(MockConnection {
                    events: self.events.clone(),
                    secure: self.secure,
                }),
                collaborators,
                Some(self.hooks.clone() as Arc<dyn ServerEventHooks>),
                self.server.clone(),
            );
            (session.run(), self)
        }

        fn releases(&self) -> Vec<String> {
            recorded(&self.events)
                .into_iter()
                .filter(|e| e.starts_with("close "))
                .collect()
        }
    }

    const RELEASE_ORDER: [&str; 4] = [
        "close output codec",
        "close input codec",
        "close output stream",
        "close input stream",
    ];

    #[test]
    fn test_idle_disconnect_pairs_context_calls() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(false)];

        let (outcome, harness) = harness.run();

        assert!(outcome.is_none());
        assert_eq!(harness.hooks.created.load(Ordering::SeqCst), 1);
        assert_eq!(harness.hooks.deleted.load(Ordering::SeqCst), 1);
        assert_eq!(harness.hooks.processed.load(Ordering::SeqCst), 0);
        assert!(harness.logger.errors().is_empty());
        assert_eq!(harness.releases(), RELEASE_ORDER);
        assert_eq!(harness.server.stats().completed_sessions, 1);
        assert_eq!(harness.server.active_session_count(), 0);
    }

    #[test]
    fn test_acquisition_order() {
        let mut harness = Harness::new();
        harness.secure = true;

        let (_, harness) = harness.run();

        let events = recorded(&harness.events);
        assert_eq!(
            &events[..5],
            [
                "handshake",
                "open input stream",
                "open output stream",
                "open input codec",
                "open output codec",
            ]
        );
    }

    #[test]
    fn test_sequential_requests_then_peer_close() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(true), Ok(true), Ok(true)];
        harness.steps = vec![
            Step::Continue,
            Step::Continue,
            Step::Fail(|| TransportError::EndOfStream.into()),
        ];

        let (outcome, harness) = harness.run();

        assert!(matches!(outcome, Some(SessionError::TransportDisconnect(_))));
        assert_eq!(harness.hooks.processed.load(Ordering::SeqCst), 3);
        assert_eq!(harness.hooks.saw_context.load(Ordering::SeqCst), 3);
        let processed = recorded(&harness.events)
            .iter()
            .filter(|e| *e == "process")
            .count();
        assert_eq!(processed, 3);
        assert!(harness.logger.errors().is_empty());
        assert_eq!(harness.releases(), RELEASE_ORDER);
    }

    #[test]
    fn test_processor_declines_further_work() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(true), Ok(true), Ok(true)];
        harness.steps = vec![Step::Continue, Step::Done];

        let (outcome, harness) = harness.run();

        assert!(outcome.is_none());
        assert_eq!(harness.hooks.processed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_during_peek_is_silent() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(true), Err(io::ErrorKind::ConnectionReset)];
        harness.steps = vec![Step::Continue];

        let (outcome, harness) = harness.run();

        assert!(matches!(outcome, Some(SessionError::TransportDisconnect(_))));
        assert!(harness.logger.errors().is_empty());
        assert_eq!(harness.server.stats().unexpected_errors, 0);
        assert_eq!(harness.hooks.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unexpected_error_logged_once_and_released() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(true), Ok(true)];
        harness.steps = vec![
            Step::Continue,
            Step::Fail(|| ProcessError::Handler("division by zero".into())),
        ];

        let (outcome, harness) = harness.run();

        assert!(matches!(outcome, Some(SessionError::UnexpectedProcessing(_))));
        let errors = harness.logger.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unexpected processing error"));
        assert_eq!(harness.server.stats().unexpected_errors, 1);
        assert_eq!(harness.hooks.deleted.load(Ordering::SeqCst), 1);
        assert_eq!(harness.releases(), RELEASE_ORDER);
    }

    #[test]
    fn test_processor_panic_is_contained() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(true)];
        harness.steps = vec![Step::Panic];

        let (outcome, harness) = harness.run();

        match outcome {
            Some(SessionError::UnexpectedProcessing(ProcessError::Panicked(msg))) => {
                assert_eq!(msg, "processor bug")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(harness.releases(), RELEASE_ORDER);
        assert_eq!(harness.hooks.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_release_does_not_skip_others() {
        let mut harness = Harness::new();
        harness.fail_input_close = true;

        let (outcome, harness) = harness.run();

        assert!(outcome.is_none());
        assert_eq!(harness.releases(), RELEASE_ORDER);
        let errors = harness.logger.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("failed to release input stream"));
        assert_eq!(harness.server.stats().release_failures, 1);
    }

    #[test]
    fn test_first_release_failing_still_releases_the_rest() {
        let mut harness = Harness::new();
        harness.output_codec_close = CloseOutcome::Panic;
        harness.input_codec_close = CloseOutcome::Fail;

        let (outcome, harness) = harness.run();

        assert!(outcome.is_none());
        assert_eq!(harness.releases(), RELEASE_ORDER);
        let errors = harness.logger.errors();
        assert_eq!(errors.len(), 2, "errors: {errors:?}");
        assert!(errors[0].contains("failed to release output codec"));
        assert!(errors[0].contains("codec close bug"));
        assert!(errors[1].contains("failed to release input codec"));
        assert_eq!(harness.server.stats().release_failures, 2);
    }

    #[test]
    fn test_stop_during_request_ends_session_after_it() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(true), Ok(true), Ok(true)];
        harness.steps = vec![Step::Continue, Step::StopServer, Step::Continue];

        let (outcome, harness) = harness.run();

        assert!(outcome.is_none());
        assert!(!harness.server.is_stop_requested());
        let processed = recorded(&harness.events)
            .iter()
            .filter(|e| *e == "process")
            .count();
        assert_eq!(processed, 2);
        assert_eq!(harness.releases(), RELEASE_ORDER);
    }

    #[test]
    fn test_partial_acquisition_releases_what_was_acquired() {
        let mut harness = Harness::new();
        harness.fail_output_codec = true;

        let (outcome, harness) = harness.run();

        assert!(matches!(outcome, Some(SessionError::UnexpectedProcessing(_))));
        assert_eq!(harness.hooks.created.load(Ordering::SeqCst), 0);
        assert_eq!(harness.hooks.deleted.load(Ordering::SeqCst), 0);
        assert_eq!(
            harness.releases(),
            ["close input codec", "close output stream", "close input stream"]
        );
    }

    #[test]
    fn test_stop_requested_skips_request_loop() {
        let mut harness = Harness::new();
        harness.peeks = vec![Ok(true)];
        harness.steps = vec![Step::Continue];
        harness.server.stop();

        let (outcome, harness) = harness.run();

        assert!(outcome.is_none());
        assert!(!recorded(&harness.events).contains(&"peek input stream".to_string()));
        assert_eq!(harness.hooks.created.load(Ordering::SeqCst), 1);
        assert_eq!(harness.hooks.deleted.load(Ordering::SeqCst), 1);
    }
}
