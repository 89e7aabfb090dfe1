/*!
# Guard Module

Reentrancy detection for Lockstep queues.

Each queue owns a `ReentrancyGuard`. The dispatch loop enters the guard right
before a task body starts and leaves it when the body returns or unwinds. The
marker is keyed by the queue's id and scoped to the thread running the body,
so a nested call from inside the body is recognized while concurrent callers
on other threads are not affected.
*/

use crate::error::{QueueError, Result};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

thread_local! {
    // Queues whose task bodies are running on this thread, innermost last.
    static RUNNING_QUEUES: RefCell<Vec<Uuid>> = const { RefCell::new(Vec::new()) };
}

/// Per-queue marker of whether a task body is currently executing
#[derive(Debug)]
pub struct ReentrancyGuard {
    queue_id: Uuid,
    in_progress: AtomicBool,
}

impl ReentrancyGuard {
    pub fn new(queue_id: Uuid) -> Self {
        Self {
            queue_id,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Mark a task body as running until the returned marker is dropped
    pub fn enter(&self) -> ExecutionMarker<'_> {
        self.in_progress.store(true, Ordering::Release);
        RUNNING_QUEUES.with(|running| running.borrow_mut().push(self.queue_id));
        ExecutionMarker { guard: self }
    }

    /// Whether the caller is inside a task body of this queue
    pub fn is_inside(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
            && RUNNING_QUEUES.with(|running| running.borrow().contains(&self.queue_id))
    }

    /// Fail with a reentrancy violation when called from inside the queue
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_inside() {
            return Err(QueueError::Reentrancy { operation });
        }
        Ok(())
    }
}

/// Clears the execution marker on drop, including during unwinding
pub struct ExecutionMarker<'a> {
    guard: &'a ReentrancyGuard,
}

impl Drop for ExecutionMarker<'_> {
    fn drop(&mut self) {
        RUNNING_QUEUES.with(|running| {
            let mut running = running.borrow_mut();
            if let Some(pos) = running.iter().rposition(|id| *id == self.guard.queue_id) {
                running.remove(pos);
            }
        });
        self.guard.in_progress.store(false, Ordering::Release);
    }
}
