use std::sync::Arc;

use crate::{
    net::traits::{Logger, TracingLogger},
    thread_pool::WorkKind,
};

/// Worker-pool bounds requested by a server.
///
/// A bound `<= 0` leaves the pool's current value untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerBounds {
    pub min_workers: i32,
    pub max_workers: i32,
    pub min_io_workers: i32,
    pub max_io_workers: i32,
}

impl WorkerBounds {
    pub fn is_unchanged(&self) -> bool {
        self.min_workers <= 0
            && self.max_workers <= 0
            && self.min_io_workers <= 0
            && self.max_io_workers <= 0
    }
}

/// Configuration for a [`ThreadPoolServer`](super::ThreadPoolServer).
///
/// Use `ServerConfig::builder()` for ergonomic construction.
///
/// ## Worker bounds
///
/// The bounds are applied to the worker pool once, when the server is built.
/// The pool is normally shared by the whole process, so the change is visible to
/// every other user of it.
///
/// ## Work kind
///
/// Sessions block on their socket for the life of a connection, so they are
/// queued on the I/O lane by default.
#[derive(Clone)]
pub struct ServerConfig {
    /// Pool bounds to apply at construction
    pub worker_bounds: WorkerBounds,
    /// Lane that connection sessions are submitted to
    pub work_kind: WorkKind,
    /// Logger for server events
    pub logger: Arc<dyn Logger>,
}

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_bounds: WorkerBounds::default(),
            work_kind: WorkKind::Io,
            logger: Arc::new(TracingLogger),
        }
    }
}

/// Builder for ServerConfig.
///
/// Unset fields fall back to `ServerConfig::default()`.
#[derive(Default)]
pub struct ServerConfigBuilder {
    worker_bounds: WorkerBounds,
    work_kind: Option<WorkKind>,
    logger: Option<Arc<dyn Logger>>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_bounds(mut self, bounds: WorkerBounds) -> Self {
        self.worker_bounds = bounds;
        self
    }

    pub fn min_workers(mut self, workers: i32) -> Self {
        self.worker_bounds.min_workers = workers;
        self
    }

    pub fn max_workers(mut self, workers: i32) -> Self {
        self.worker_bounds.max_workers = workers;
        self
    }

    pub fn min_io_workers(mut self, workers: i32) -> Self {
        self.worker_bounds.min_io_workers = workers;
        self
    }

    pub fn max_io_workers(mut self, workers: i32) -> Self {
        self.worker_bounds.max_io_workers = workers;
        self
    }

    /// Set the pool lane connection sessions run on
    pub fn work_kind(mut self, kind: WorkKind) -> Self {
        self.work_kind = Some(kind);
        self
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            worker_bounds: self.worker_bounds,
            work_kind: self.work_kind.unwrap_or(default.work_kind),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}
