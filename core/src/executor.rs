/*!
# Executor Module

This module defines the boundary between a Lockstep queue and whatever
physically runs its work.

The queue needs only four primitives from its environment:
- run a job now
- arm a one-shot timer that runs a job after a delay
- cancel an armed timer by token
- tell whether the caller is on the executor's own threads

The executor is free to run jobs concurrently; the queue serializes task
bodies on its own. `TokioExecutor` is the default implementation, backed by a
dedicated multi-thread tokio runtime.
*/

use crate::error::{QueueError, Result};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// A job handed to the executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a timer armed through [`Executor::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Primitives a queue consumes from its environment
pub trait Executor: Send + Sync + 'static {
    /// Run a job as soon as possible
    fn execute(&self, job: Job);

    /// Run a job once `delay` has elapsed
    fn schedule(&self, delay: Duration, job: Job) -> TimerToken;

    /// Disarm a timer; a no-op if it already fired or was canceled
    fn cancel(&self, token: TimerToken);

    /// Whether the calling thread belongs to this executor
    fn is_current_context(&self) -> bool;
}

thread_local! {
    static CURRENT_EXECUTOR: Cell<Option<Uuid>> = const { Cell::new(None) };
}

/// Executor backed by a dedicated tokio runtime
pub struct TokioExecutor {
    id: Uuid,
    name: String,
    runtime: Option<Runtime>,
    handle: Handle,
    timers: Arc<Mutex<HashMap<TimerToken, AbortHandle>>>,
    next_token: AtomicU64,
}

impl TokioExecutor {
    /// Build a runtime with `worker_threads` threads named after `name`
    pub fn new(name: impl Into<String>, worker_threads: usize) -> Result<Self> {
        let name = name.into();
        let id = Uuid::new_v4();

        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(format!("{}-worker", name))
            .enable_time()
            .on_thread_start(move || CURRENT_EXECUTOR.with(|current| current.set(Some(id))))
            .on_thread_stop(|| CURRENT_EXECUTOR.with(|current| current.set(None)))
            .build()
            .map_err(|e| QueueError::ExecutorUnavailable(format!("{}: {}", name, e)))?;

        debug!("Started executor {} with {} worker threads", name, worker_threads.max(1));

        Ok(Self {
            id,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            name,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        })
    }

    /// Name given to this executor's worker threads
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of timers armed and not yet fired or canceled
    pub fn armed_timers(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }

    fn schedule(&self, delay: Duration, job: Job) -> TimerToken {
        let token = TimerToken::new(self.next_token.fetch_add(1, Ordering::Relaxed));
        let timers = Arc::clone(&self.timers);

        // Hold the table while spawning so the timer cannot finish and clean
        // up before its abort handle is recorded.
        let mut armed = self.timers.lock();
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if timers.lock().remove(&token).is_some() {
                job();
            }
        });
        armed.insert(token, handle.abort_handle());
        trace!("Armed timer {} on {} for {:?}", token.raw(), self.name, delay);

        token
    }

    fn cancel(&self, token: TimerToken) {
        if let Some(handle) = self.timers.lock().remove(&token) {
            handle.abort();
            trace!("Canceled timer {} on {}", token.raw(), self.name);
        }
    }

    fn is_current_context(&self) -> bool {
        CURRENT_EXECUTOR.with(|current| current.get() == Some(self.id))
    }
}

impl Drop for TokioExecutor {
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
        // Never blocks, so it is legal even on one of the runtime's own threads.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!("Stopped executor {}", self.name);
    }
}
