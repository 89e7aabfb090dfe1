/*!
# Queue Module

This module defines `AsyncQueue`, the serialized task queue at the heart of
Lockstep.

The queue is responsible for:
- Admitting tasks into a FIFO and running them one at a time, in order
- Rejecting reentrant calls that would deadlock or break ordering
- Scheduling cancelable delayed operations that re-enter the FIFO when due
- Driving the one-way shutdown transition
- Cancelling pending work and waiting for the running task on drop

The FIFO, the delayed-task table and the shutdown gate share a single lock.
Task bodies always run with that lock released. Whatever an executor does
with concurrency, at most one dispatch pass exists at a time, so task bodies
never overlap.
*/

use crate::error::{QueueError, Result};
use crate::executor::{Executor, TimerToken, TokioExecutor};
use crate::guard::ReentrancyGuard;
use crate::scheduler::{
    CancelScheduled, DelayedOperation, DelayedScheduler, ScheduleKey, ScheduledTask, TimerTag,
};
use crate::shutdown::{QueueState, ShutdownGate};
use crate::task::{panic_message, Task, TaskCategory};
use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};
use uuid::Uuid;

/// Configuration for a queue
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Name used in log lines and executor thread names
    pub name: String,

    /// Threads backing the default executor. Task bodies never overlap
    /// regardless of this value.
    pub worker_threads: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "lockstep".to_string(),
            worker_threads: 1,
        }
    }
}

/// State guarded by the queue's single lock
struct CoreState<T> {
    fifo: VecDeque<Task>,
    /// A dispatch pass is scheduled or running
    draining: bool,
    /// A task body is executing right now
    running: bool,
    gate: ShutdownGate,
    scheduler: DelayedScheduler<T>,
    disposed: bool,
}

/// Work collected under the lock and carried out after releasing it.
///
/// Dropped tasks are released here too: their captures may hold the last
/// reference to the queue itself.
#[derive(Default)]
struct Deferred {
    start_dispatch: bool,
    dropped: Vec<Task>,
    timers: Vec<TimerToken>,
}

// Roughly 30 years, the horizon tokio uses for unbounded sleeps.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Absolute target for `delay` from now, saturating for huge delays
fn target_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

struct Shared<T> {
    name: String,
    executor: Arc<dyn Executor>,
    state: Mutex<CoreState<T>>,
    idle: Condvar,
    guard: ReentrancyGuard,
}

impl<T: TimerTag> Shared<T> {
    fn push(
        &self,
        state: &mut CoreState<T>,
        category: TaskCategory,
        task: Task,
        deferred: &mut Deferred,
    ) {
        if state.disposed || !state.gate.admits(category) {
            debug!("Queue {} dropped a {} task after shutdown", self.name, category);
            deferred.dropped.push(task);
            return;
        }

        state.fifo.push_back(task);
        if !state.draining {
            state.draining = true;
            deferred.start_dispatch = true;
        }
    }

    fn admit(self: &Arc<Self>, category: TaskCategory, task: Task) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            self.push(&mut state, category, task, &mut deferred);
        }
        self.finish(deferred);
    }

    /// Hand fired delayed tasks to the FIFO, in the order given
    fn admit_fired(
        &self,
        state: &mut CoreState<T>,
        due: Vec<ScheduledTask<T>>,
        deferred: &mut Deferred,
    ) {
        for entry in due {
            trace!("Queue {} admitting delayed {:?}", self.name, entry.tag);
            deferred.timers.extend(entry.timer);
            self.push(state, TaskCategory::Normal, entry.task, deferred);
        }
    }

    fn finish(self: &Arc<Self>, deferred: Deferred) {
        for token in deferred.timers {
            self.executor.cancel(token);
        }
        drop(deferred.dropped);
        if deferred.start_dispatch {
            self.start_dispatch();
        }
    }

    fn start_dispatch(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.executor.execute(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch();
            }
        }));
    }

    /// Run queued tasks until the FIFO is empty
    fn dispatch(&self) {
        let mut state = self.state.lock();
        loop {
            let Some(task) = state.fifo.pop_front() else {
                state.draining = false;
                self.idle.notify_all();
                return;
            };

            state.running = true;
            MutexGuard::unlocked(&mut state, || self.run(task));
            state.running = false;
            self.idle.notify_all();
        }
    }

    fn run(&self, task: Task) {
        let _marker = self.guard.enter();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                "Task on queue {} panicked: {}",
                self.name,
                panic_message(payload.as_ref())
            );
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration, tag: T, task: Task) -> DelayedOperation {
        let mut state = self.state.lock();
        if state.disposed || state.gate.is_terminated() {
            drop(state);
            debug!("Queue {} ignored delayed {:?} after shutdown", self.name, tag);
            return DelayedOperation::default();
        }
        let key = state.scheduler.schedule(target_after(delay), tag, task);
        drop(state);

        let weak = Arc::downgrade(self);
        let token = self.executor.schedule(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.fire(key);
                }
            }),
        );

        let attached = self.state.lock().scheduler.attach_timer(key, token);
        if !attached {
            self.executor.cancel(token);
        }
        trace!("Queue {} scheduled {:?} in {:?}", self.name, tag, delay);

        let owner: Weak<Shared<T>> = Arc::downgrade(self);
        let owner: Weak<dyn CancelScheduled> = owner;
        DelayedOperation::new(key, owner)
    }

    /// Timer callback: admit `key` and everything ordered before it
    fn fire(self: &Arc<Self>, key: ScheduleKey) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            if !state.scheduler.contains(key) {
                return;
            }
            let due = state.scheduler.take_through(key);
            self.admit_fired(&mut state, due, &mut deferred);
        }
        self.finish(deferred);
    }

    fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.draining {
            self.idle.wait(&mut state);
        }
    }

    fn dispose(&self) {
        let (abandoned, canceled) = {
            let mut state = self.state.lock();
            state.disposed = true;
            (mem::take(&mut state.fifo), state.scheduler.take_all())
        };

        for token in canceled.iter().filter_map(|entry| entry.timer) {
            self.executor.cancel(token);
        }
        let (queued, delayed) = (abandoned.len(), canceled.len());
        drop(abandoned);
        drop(canceled);

        // A task dropping its own queue cannot wait for itself.
        if !self.guard.is_inside() {
            let mut state = self.state.lock();
            while state.running {
                self.idle.wait(&mut state);
            }
        }

        info!(
            "Disposed queue {} (discarded {} queued and {} delayed tasks)",
            self.name, queued, delayed
        );
    }
}

impl<T: TimerTag> CancelScheduled for Shared<T> {
    fn cancel_scheduled(&self, key: ScheduleKey) {
        let canceled = self.state.lock().scheduler.cancel(key);
        if let Some(entry) = canceled {
            if let Some(token) = entry.timer {
                self.executor.cancel(token);
            }
            trace!("Queue {} canceled delayed {:?}", self.name, entry.tag);
        }
    }
}

/// A serialized task queue with delayed operations and graceful shutdown.
///
/// Task bodies run one at a time in admission order. Delayed operations fire
/// in `(target time, scheduling order)` and then take their place in the
/// same FIFO as everything else.
pub struct AsyncQueue<T: TimerTag> {
    shared: Arc<Shared<T>>,
}

impl<T: TimerTag> AsyncQueue<T> {
    /// Create a queue backed by a tokio executor with default configuration
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(QueueConfig::default())
    }

    /// Create a queue backed by a tokio executor built from `config`
    pub fn with_config(config: QueueConfig) -> Result<Arc<Self>> {
        let executor = TokioExecutor::new(config.name.clone(), config.worker_threads)?;
        Ok(Self::with_executor(Arc::new(executor), config))
    }

    /// Create a queue on top of an existing executor
    pub fn with_executor(executor: Arc<dyn Executor>, config: QueueConfig) -> Arc<Self> {
        let id = Uuid::new_v4();
        info!("Created queue {} ({})", config.name, id);

        Arc::new(Self {
            shared: Arc::new(Shared {
                name: config.name,
                executor,
                state: Mutex::new(CoreState {
                    fifo: VecDeque::new(),
                    draining: false,
                    running: false,
                    gate: ShutdownGate::new(),
                    scheduler: DelayedScheduler::new(),
                    disposed: false,
                }),
                idle: Condvar::new(),
                guard: ReentrancyGuard::new(id),
            }),
        })
    }

    /// Name from the queue's configuration
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a task at the tail of the FIFO.
    ///
    /// Fails without running `operation` when called from a task already
    /// running on this queue; use [`enqueue_relaxed`](Self::enqueue_relaxed)
    /// there instead. After shutdown the task is silently dropped.
    pub fn enqueue<F>(&self, operation: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.guard.check("enqueue")?;
        self.shared.admit(TaskCategory::Normal, Box::new(operation));
        Ok(())
    }

    /// Like [`enqueue`](Self::enqueue), but legal from inside the queue
    pub fn enqueue_relaxed<F>(&self, operation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.admit(TaskCategory::Relaxed, Box::new(operation));
    }

    /// Enqueue a task and block until it has run.
    ///
    /// Returns immediately if the task was dropped because the queue shut
    /// down.
    pub fn enqueue_blocking<F>(&self, operation: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.guard.check("enqueue_blocking")?;
        self.run_blocking(TaskCategory::Normal, operation)
    }

    /// Run a task on the queue and block until it has run, even if shutdown
    /// was already initiated.
    pub fn execute_blocking<F>(&self, operation: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.guard.check("execute_blocking")?;
        self.run_blocking(TaskCategory::PostShutdown, operation)
    }

    fn run_blocking<F>(&self, category: TaskCategory, operation: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.shared.admit(
            category,
            Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(operation));
                let _ = done_tx.send(outcome.is_ok());
                if let Err(payload) = outcome {
                    panic::resume_unwind(payload);
                }
            }),
        );

        match futures::executor::block_on(done_rx) {
            Ok(true) => Ok(()),
            Ok(false) => Err(QueueError::TaskPanicked),
            Err(oneshot::Canceled) => {
                debug!("Blocking task on queue {} was dropped", self.shared.name);
                Ok(())
            }
        }
    }

    /// Schedule a task to be enqueued once `delay` has elapsed.
    ///
    /// Legal from inside the queue. When the delay elapses the task joins the
    /// FIFO as a normal task, so it is dropped if shutdown began meanwhile.
    pub fn enqueue_after_delay<F>(&self, delay: Duration, tag: T, operation: F) -> DelayedOperation
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.schedule(delay, tag, Box::new(operation))
    }

    /// Whether a delayed operation tagged `tag` is still pending.
    ///
    /// Tags are compared by equality, `T::ALL` included.
    pub fn is_scheduled(&self, tag: T) -> bool {
        self.shared.state.lock().scheduler.is_scheduled(tag)
    }

    /// Enqueue `operation` as the last normal task, then stop admitting
    /// normal work.
    pub fn enqueue_and_initiate_shutdown<F>(&self, operation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut deferred = Deferred::default();
        {
            let mut state = self.shared.state.lock();
            self.shared
                .push(&mut state, TaskCategory::Normal, Box::new(operation), &mut deferred);
            if state.gate.terminate() {
                info!("Queue {} initiated shutdown", self.shared.name);
            }
        }
        self.shared.finish(deferred);
    }

    /// Enqueue a task that runs regardless of the shutdown state
    pub fn enqueue_even_after_shutdown<F>(&self, operation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.admit(TaskCategory::PostShutdown, Box::new(operation));
    }

    /// Lifecycle state of the queue
    pub fn state(&self) -> QueueState {
        self.shared.state.lock().gate.state()
    }

    /// Whether `enqueue_and_initiate_shutdown` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state() == QueueState::Terminated
    }

    /// Succeeds only when called from a task running on this queue.
    ///
    /// Decided by the queue's own execution marker, so it holds for any
    /// executor.
    pub fn verify_is_current_queue(&self) -> Result<()> {
        if self.shared.guard.is_inside() {
            Ok(())
        } else {
            Err(QueueError::NotCurrentQueue)
        }
    }

    /// Fire pending delayed operations early, for tests.
    ///
    /// Every operation ordered at or before the earliest one tagged `tag` is
    /// admitted immediately, in firing order; `T::ALL` selects all of them.
    /// Blocks until the queue is idle, which includes any work the fired
    /// operations enqueue. Must be called from outside the queue.
    pub fn run_scheduled_operations_until(&self, tag: T) -> Result<()> {
        let shared = &self.shared;
        if shared.guard.is_inside() || shared.executor.is_current_context() {
            return Err(QueueError::Reentrancy {
                operation: "run_scheduled_operations_until",
            });
        }

        let mut deferred = Deferred::default();
        {
            let mut state = shared.state.lock();
            let due = match state.scheduler.drain_boundary(tag) {
                Some(boundary) => state.scheduler.take_through(boundary),
                None if tag.is_all() => Vec::new(),
                None => return Err(QueueError::TagNotScheduled(format!("{:?}", tag))),
            };
            debug!(
                "Queue {} running {} delayed operations early",
                shared.name,
                due.len()
            );
            shared.admit_fired(&mut state, due, &mut deferred);
        }
        shared.finish(deferred);
        shared.wait_idle();

        Ok(())
    }
}

impl<T: TimerTag> Drop for AsyncQueue<T> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl<T: TimerTag> fmt::Debug for AsyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Job;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Timer {
        All,
        Backoff,
        Idle,
    }

    impl TimerTag for Timer {
        const ALL: Self = Timer::All;
    }

    /// Executor that only runs jobs and timers when told to
    #[derive(Default)]
    struct ManualExecutor {
        jobs: Mutex<VecDeque<Job>>,
        timers: Mutex<Vec<(TimerToken, Job)>>,
        next_token: AtomicU64,
    }

    impl ManualExecutor {
        fn run_jobs(&self) -> usize {
            let mut ran = 0;
            loop {
                let job = self.jobs.lock().pop_front();
                match job {
                    Some(job) => {
                        job();
                        ran += 1;
                    }
                    None => return ran,
                }
            }
        }

        fn fire_timer(&self, index: usize) {
            let (_, job) = self.timers.lock().remove(index);
            job();
        }

        fn armed(&self) -> usize {
            self.timers.lock().len()
        }
    }

    impl Executor for ManualExecutor {
        fn execute(&self, job: Job) {
            self.jobs.lock().push_back(job);
        }

        fn schedule(&self, _delay: Duration, job: Job) -> TimerToken {
            let token = TimerToken::new(self.next_token.fetch_add(1, Ordering::Relaxed));
            self.timers.lock().push((token, job));
            token
        }

        fn cancel(&self, token: TimerToken) {
            self.timers.lock().retain(|(armed, _)| *armed != token);
        }

        fn is_current_context(&self) -> bool {
            false
        }
    }

    fn manual_queue() -> (Arc<ManualExecutor>, Arc<AsyncQueue<Timer>>) {
        let executor = Arc::new(ManualExecutor::default());
        let queue = AsyncQueue::with_executor(executor.clone(), QueueConfig::default());
        (executor, queue)
    }

    fn recorder(trace: &Arc<Mutex<String>>, mark: char) -> impl FnOnce() + Send + 'static {
        let trace = Arc::clone(trace);
        move || trace.lock().push(mark)
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: QueueConfig = serde_json::from_str(r#"{"name": "firestore"}"#).unwrap();
        assert_eq!(config.name, "firestore");
        assert_eq!(config.worker_threads, 1);

        let config: QueueConfig = serde_json::from_str(r#"{"worker_threads": 4}"#).unwrap();
        assert_eq!(config.name, "lockstep");
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn one_dispatch_pass_runs_the_whole_fifo() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        queue.enqueue(recorder(&trace, 'a')).unwrap();
        queue.enqueue(recorder(&trace, 'b')).unwrap();
        queue.enqueue_relaxed(recorder(&trace, 'c'));

        assert_eq!(trace.lock().as_str(), "");
        assert_eq!(executor.run_jobs(), 1);
        assert_eq!(trace.lock().as_str(), "abc");
    }

    #[test]
    fn late_timer_admits_earlier_operations_first() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        queue.enqueue_after_delay(Duration::from_secs(20), Timer::Backoff, recorder(&trace, 'b'));
        queue.enqueue_after_delay(Duration::from_secs(10), Timer::Idle, recorder(&trace, 'a'));
        assert_eq!(executor.armed(), 2);

        // The 20s timer fires first, yet the 10s operation is admitted ahead.
        executor.fire_timer(0);
        assert!(!queue.is_scheduled(Timer::Backoff));
        assert!(!queue.is_scheduled(Timer::Idle));
        assert_eq!(executor.armed(), 0);

        executor.run_jobs();
        assert_eq!(trace.lock().as_str(), "ab");
    }

    #[test]
    fn fired_operation_queues_behind_earlier_admissions() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        queue.enqueue_after_delay(Duration::from_millis(1), Timer::Idle, recorder(&trace, 'd'));
        queue.enqueue(recorder(&trace, 'n')).unwrap();
        executor.fire_timer(0);
        queue.enqueue_relaxed(recorder(&trace, 'r'));

        executor.run_jobs();
        assert_eq!(trace.lock().as_str(), "ndr");
    }

    #[test]
    fn cancel_disarms_the_timer() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        let handle =
            queue.enqueue_after_delay(Duration::from_secs(1), Timer::Backoff, recorder(&trace, 'x'));
        assert!(queue.is_scheduled(Timer::Backoff));

        handle.cancel();
        handle.clone().cancel();

        assert!(!queue.is_scheduled(Timer::Backoff));
        assert_eq!(executor.armed(), 0);
        executor.run_jobs();
        assert_eq!(trace.lock().as_str(), "");
    }

    #[test]
    fn delayed_operations_are_ignored_after_shutdown() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        assert_eq!(queue.state(), QueueState::Running);
        queue.enqueue_and_initiate_shutdown(recorder(&trace, 's'));
        assert!(queue.is_shutting_down());
        assert_eq!(queue.state(), QueueState::Terminated);

        let handle =
            queue.enqueue_after_delay(Duration::from_millis(1), Timer::Idle, recorder(&trace, 'x'));
        assert!(handle.key().is_none());
        assert!(!queue.is_scheduled(Timer::Idle));
        assert_eq!(executor.armed(), 0);

        executor.run_jobs();
        assert_eq!(trace.lock().as_str(), "s");
    }

    #[test]
    fn pending_operation_fired_after_shutdown_is_dropped() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        queue.enqueue_after_delay(Duration::from_millis(1), Timer::Idle, recorder(&trace, 'x'));
        queue.enqueue_and_initiate_shutdown(recorder(&trace, 's'));
        executor.fire_timer(0);

        executor.run_jobs();
        assert_eq!(trace.lock().as_str(), "s");
    }

    #[test]
    fn drop_cancels_pending_work() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        let handle =
            queue.enqueue_after_delay(Duration::from_secs(60), Timer::Backoff, recorder(&trace, 'd'));
        queue.enqueue(recorder(&trace, 'q')).unwrap();
        drop(queue);

        assert_eq!(executor.armed(), 0);
        executor.run_jobs();
        handle.cancel();
        assert_eq!(trace.lock().as_str(), "");
    }

    #[test]
    fn huge_delay_is_scheduled_without_overflow() {
        let (executor, queue) = manual_queue();
        let trace = Arc::new(Mutex::new(String::new()));

        let handle = queue.enqueue_after_delay(Duration::MAX, Timer::Idle, recorder(&trace, 'x'));
        assert!(queue.is_scheduled(Timer::Idle));
        assert_eq!(executor.armed(), 1);

        handle.cancel();
        assert!(!queue.is_scheduled(Timer::Idle));
        assert_eq!(executor.armed(), 0);
        executor.run_jobs();
        assert_eq!(trace.lock().as_str(), "");
    }

    #[test]
    fn verify_is_current_queue_relies_on_the_execution_marker() {
        let (executor, queue) = manual_queue();
        let (result, await_result) = std::sync::mpsc::channel();

        // ManualExecutor never reports being the current context.
        let inner = Arc::clone(&queue);
        queue
            .enqueue(move || {
                result.send(inner.verify_is_current_queue()).unwrap();
            })
            .unwrap();
        executor.run_jobs();

        assert!(await_result.recv().unwrap().is_ok());
        assert!(matches!(
            queue.verify_is_current_queue(),
            Err(QueueError::NotCurrentQueue)
        ));
    }
}
