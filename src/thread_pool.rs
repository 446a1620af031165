use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread::{self, Builder, JoinHandle},
    time::Duration,
};

use crate::error::PoolError;

pub const DEFAULT_POOL_CAPACITY: usize = 4;
pub const DEFAULT_MAX_IO_WORKERS: usize = 256;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(20);
/// How long dropping a pool waits for busy workers before detaching them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Which lane of the pool a task is queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    Compute,
    Io,
}

/// Minimum and maximum live workers for both lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolBounds {
    pub min_workers: usize,
    pub max_workers: usize,
    pub min_io_workers: usize,
    pub max_io_workers: usize,
}

/// Capability to run units of work on a bounded set of worker threads.
///
/// The server never owns the pool: a single pool is usually shared by the whole
/// process, so bound changes made through this trait are visible to every user.
/// Both setters validate the full pair before touching either lane; on error the
/// pool is left exactly as it was.
pub trait WorkerSubmitter: Send + Sync {
    fn submit(&self, kind: WorkKind, task: Task) -> Result<(), PoolError>;

    fn bounds(&self) -> PoolBounds;

    fn set_max_workers(&self, workers: usize, io_workers: usize) -> Result<(), PoolError>;

    fn set_min_workers(&self, workers: usize, io_workers: usize) -> Result<(), PoolError>;
}

struct LaneState {
    queue: VecDeque<Task>,
    live: usize,
    idle: usize,
    min: usize,
    max: usize,
    shutdown: bool,
}

struct Lane {
    kind: WorkKind,
    state: Mutex<LaneState>,
    condvar: Condvar,
    exited: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
    keep_alive: Duration,
    #[cfg(test)]
    refuse_spawn: std::sync::atomic::AtomicBool,
}

impl Lane {
    fn new(kind: WorkKind, min: usize, max: usize, keep_alive: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(LaneState {
                queue: VecDeque::new(),
                live: 0,
                idle: 0,
                min,
                max,
                shutdown: false,
            }),
            condvar: Condvar::new(),
            exited: Condvar::new(),
            handles: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            keep_alive,
            #[cfg(test)]
            refuse_spawn: std::sync::atomic::AtomicBool::new(false),
        })
    }

    // Tasks run outside the lock and behind catch_unwind, so a poisoned guard
    // still protects consistent counters.
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(self: &Arc<Self>, task: Task) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }
        state.queue.push_back(task);

        // Idle workers that have not woken yet still count as idle, so only grow
        // when the backlog outnumbers them.
        if state.queue.len() > state.idle && state.live < state.max {
            if let Err(e) = self.spawn_worker(&mut state) {
                // with no live worker the task would sit in the queue forever
                if state.live == 0 {
                    state.queue.pop_back();
                    return Err(PoolError::Spawn(e.to_string()));
                }
            }
        }
        self.condvar.notify_one();
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut LaneState) -> io::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let prefix = match self.kind {
            WorkKind::Compute => "compute-worker",
            WorkKind::Io => "io-worker",
        };
        let lane = Arc::clone(self);
        let spawned = self
            .check_spawn()
            .and_then(|()| {
                Builder::new()
                    .name(format!("{prefix}-{id}"))
                    .spawn(move || lane.run_worker())
            });

        match spawned {
            Ok(handle) => {
                state.live += 1;
                let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!(lane = ?self.kind, "failed to spawn worker thread: {e}");
                Err(e)
            }
        }
    }

    #[cfg(not(test))]
    fn check_spawn(&self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn check_spawn(&self) -> io::Result<()> {
        if self.refuse_spawn.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "thread limit reached"));
        }
        Ok(())
    }

    fn run_worker(self: Arc<Self>) {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                drop(state);
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!(lane = ?self.kind, "worker task panicked");
                }
                state = self.lock();
                continue;
            }

            if state.shutdown || state.live > state.max {
                break;
            }

            state.idle += 1;
            let (guard, wait) = self
                .condvar
                .wait_timeout(state, self.keep_alive)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.idle -= 1;

            if wait.timed_out() && state.queue.is_empty() && state.live > state.min {
                break;
            }
        }
        state.live -= 1;
        self.exited.notify_all();
    }

    fn ensure_min(self: &Arc<Self>, state: &mut LaneState) {
        while state.live < state.min {
            if self.spawn_worker(state).is_err() {
                break;
            }
        }
    }

    /// Stops the lane. Idle workers exit at once; workers still running a task
    /// get `grace` to finish and are detached after that. A detached worker exits
    /// on its own once its task returns.
    fn shutdown(&self, grace: Duration) {
        let current = thread::current().id();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        // a pool dropped from one of its own workers cannot wait for that worker
        let own = handles.iter().filter(|h| h.thread().id() == current).count();

        let mut state = self.lock();
        state.shutdown = true;
        self.condvar.notify_all();
        let (state, _) = self
            .exited
            .wait_timeout_while(state, grace, |s| s.live > own)
            .unwrap_or_else(PoisonError::into_inner);
        let busy = state.live.saturating_sub(own);
        drop(state);

        if busy > 0 {
            tracing::warn!(lane = ?self.kind, busy, "detaching workers still running tasks");
        }
        for handle in handles {
            if handle.thread().id() != current && handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

/// Elastic worker pool with separate lanes for compute-bound and I/O-bound work.
///
/// Each lane keeps at least `min` workers alive, grows on demand up to `max`
/// while no idle worker can take a task, and queues anything beyond that.
/// Idle workers above `min` retire after the keep-alive period.
pub struct WorkerPool {
    compute: Arc<Lane>,
    io: Arc<Lane>,
}

static GLOBAL_POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

impl Default for WorkerPool {
    fn default() -> Self {
        let bounds = PoolBounds {
            min_workers: 0,
            max_workers: default_capacity(),
            min_io_workers: 0,
            max_io_workers: DEFAULT_MAX_IO_WORKERS,
        };
        Self::build(bounds, DEFAULT_KEEP_ALIVE)
    }
}

impl WorkerPool {
    pub fn new(bounds: PoolBounds) -> Result<Self, PoolError> {
        Self::with_keep_alive(bounds, DEFAULT_KEEP_ALIVE)
    }

    pub fn with_keep_alive(bounds: PoolBounds, keep_alive: Duration) -> Result<Self, PoolError> {
        validate(WorkKind::Compute, bounds.min_workers, bounds.max_workers)?;
        validate(WorkKind::Io, bounds.min_io_workers, bounds.max_io_workers)?;
        Ok(Self::build(bounds, keep_alive))
    }

    fn build(bounds: PoolBounds, keep_alive: Duration) -> Self {
        let pool = Self {
            compute: Lane::new(
                WorkKind::Compute,
                bounds.min_workers,
                bounds.max_workers,
                keep_alive,
            ),
            io: Lane::new(
                WorkKind::Io,
                bounds.min_io_workers,
                bounds.max_io_workers,
                keep_alive,
            ),
        };
        for lane in [&pool.compute, &pool.io] {
            let mut state = lane.lock();
            lane.ensure_min(&mut state);
        }
        pool
    }

    /// The process-wide pool shared by every server that is not given its own.
    pub fn global() -> Arc<WorkerPool> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| Arc::new(WorkerPool::default())))
    }

    pub fn exec<F>(&self, kind: WorkKind, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.lane(kind).submit(Box::new(task))
    }

    pub fn live_workers(&self, kind: WorkKind) -> usize {
        self.lane(kind).lock().live
    }

    pub fn queued(&self, kind: WorkKind) -> usize {
        self.lane(kind).lock().queue.len()
    }

    fn lane(&self, kind: WorkKind) -> &Arc<Lane> {
        match kind {
            WorkKind::Compute => &self.compute,
            WorkKind::Io => &self.io,
        }
    }
}

fn default_capacity() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

fn validate(kind: WorkKind, min: usize, max: usize) -> Result<(), PoolError> {
    if max == 0 {
        return Err(PoolError::ZeroWorkers(kind));
    }
    if min > max {
        return Err(PoolError::InvalidBounds { kind, min, max });
    }
    Ok(())
}

impl WorkerSubmitter for WorkerPool {
    fn submit(&self, kind: WorkKind, task: Task) -> Result<(), PoolError> {
        self.lane(kind).submit(task)
    }

    fn bounds(&self) -> PoolBounds {
        let compute = self.compute.lock();
        let io = self.io.lock();
        PoolBounds {
            min_workers: compute.min,
            max_workers: compute.max,
            min_io_workers: io.min,
            max_io_workers: io.max,
        }
    }

    fn set_max_workers(&self, workers: usize, io_workers: usize) -> Result<(), PoolError> {
        let mut compute = self.compute.lock();
        let mut io = self.io.lock();
        validate(WorkKind::Compute, compute.min, workers)?;
        validate(WorkKind::Io, io.min, io_workers)?;

        compute.max = workers;
        io.max = io_workers;
        // surplus workers notice the lower ceiling once they wake
        self.compute.condvar.notify_all();
        self.io.condvar.notify_all();
        Ok(())
    }

    fn set_min_workers(&self, workers: usize, io_workers: usize) -> Result<(), PoolError> {
        let mut compute = self.compute.lock();
        let mut io = self.io.lock();
        validate(WorkKind::Compute, workers, compute.max)?;
        validate(WorkKind::Io, io_workers, io.max)?;

        compute.min = workers;
        io.min = io_workers;
        self.compute.ensure_min(&mut compute);
        self.io.ensure_min(&mut io);
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.compute.shutdown(SHUTDOWN_GRACE);
        self.io.shutdown(SHUTDOWN_GRACE);
    }
}
