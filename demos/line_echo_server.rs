//! A small line-oriented key/value service.
//!
//! ```text
//! $ RUST_LOG=mill_rpc=debug cargo run --example line_echo_server
//! $ nc 127.0.0.1 9090
//! SET greeting hello
//! OK
//! GET greeting
//! hello
//! ECHO anything at all
//! anything at all
//! SHUTDOWN
//! BYE
//! ```
//!
//! Every connection gets a request counter through the event hooks; it is
//! logged when the connection closes.

use lock_freedom::map::Map;
use mill_rpc::prelude::*;
use std::{
    env,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Store = Arc<Map<String, String>>;

struct KvProcessor {
    store: Store,
    server: ServerHandle,
}

impl KvProcessor {
    fn respond(&self, request: &str) -> String {
        let mut parts = request.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("PING"), None, None) => "PONG".to_owned(),
            (Some("ECHO"), Some(first), rest) => match rest {
                Some(rest) => format!("{first} {rest}"),
                None => first.to_owned(),
            },
            (Some("SET"), Some(key), Some(value)) => {
                self.store.insert(key.to_owned(), value.to_owned());
                "OK".to_owned()
            }
            (Some("GET"), Some(key), None) => match self.store.get(key) {
                Some(entry) => entry.val().clone(),
                None => "(nil)".to_owned(),
            },
            (Some("KEYS"), None, None) => {
                let mut keys: Vec<String> = self.store.iter().map(|e| e.key().clone()).collect();
                keys.sort();
                keys.join(" ")
            }
            (Some("STATS"), None, None) => {
                let stats = self.server.stats();
                format!(
                    "accepted={} active={} completed={}",
                    stats.accepted, stats.active_sessions, stats.completed_sessions
                )
            }
            _ => format!("ERR unknown request: {request}"),
        }
    }
}

impl Processor for KvProcessor {
    fn process(&mut self, input: &mut dyn Codec, output: &mut dyn Codec) -> Result<bool, ProcessError> {
        let Some(line) = input.read_message()? else {
            return Ok(false);
        };
        let request = String::from_utf8(line)
            .map_err(|e| ProcessError::Codec(format!("request is not UTF-8: {e}")))?;

        if request == "SHUTDOWN" {
            output.write_message(b"BYE")?;
            output.flush()?;
            self.server.stop();
            return Ok(false);
        }

        output.write_message(self.respond(request.trim()).as_bytes())?;
        output.flush()?;
        Ok(true)
    }
}

struct KvFactory {
    store: Store,
}

impl ProcessorFactory for KvFactory {
    fn processor(
        &self,
        _connection: &Arc<dyn Connection>,
        server: &ServerHandle,
    ) -> Result<Box<dyn Processor>, ProcessError> {
        Ok(Box::new(KvProcessor {
            store: self.store.clone(),
            server: server.clone(),
        }))
    }
}

/// Counts requests per connection.
struct RequestCounter;

impl ServerEventHooks for RequestCounter {
    fn pre_serve(&self) {
        info!("accepting connections");
    }

    fn create_context(&self, _input: &mut dyn Codec, _output: &mut dyn Codec) -> Option<ConnectionContext> {
        Some(Box::new(AtomicU64::new(0)))
    }

    fn process_context(&self, context: Option<&mut ConnectionContext>, _input: &dyn Stream) {
        if let Some(counter) = context.and_then(|c| c.downcast_ref::<AtomicU64>()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn delete_context(
        &self,
        context: Option<ConnectionContext>,
        _input: &mut dyn Codec,
        _output: &mut dyn Codec,
    ) {
        if let Some(counter) = context.as_ref().and_then(|c| c.downcast_ref::<AtomicU64>()) {
            info!(requests = counter.load(Ordering::Relaxed), "connection closed");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_owned())
        .parse()?;

    let config = ServerConfig::builder()
        .min_io_workers(4)
        .max_io_workers(64)
        .build();
    let server = ThreadPoolServer::builder(
        Arc::new(TcpServerTransport::new(addr)),
        Arc::new(KvFactory {
            store: Arc::new(Map::new()),
        }),
    )
    .event_hooks(Arc::new(RequestCounter))
    .config(config)
    .build()?;

    server.serve()?;

    let handle = server.handle();
    handle.wait_idle(std::time::Duration::from_secs(5));
    let stats = handle.stats();
    info!(
        accepted = stats.accepted,
        completed = stats.completed_sessions,
        errors = stats.unexpected_errors,
        "server stopped"
    );
    Ok(())
}
