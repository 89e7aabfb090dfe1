/*!
# Shutdown Module

The one-way lifecycle of a Lockstep queue.

A queue starts `Running` and moves to `Terminated` exactly once, when
`enqueue_and_initiate_shutdown` is called. After that, only post-shutdown
tasks are admitted; everything else is dropped without error.
*/

use crate::task::TaskCategory;

/// Lifecycle state of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    Terminated,
}

/// Admission gate driven by the queue's lifecycle state
#[derive(Debug)]
pub struct ShutdownGate {
    state: QueueState,
}

impl ShutdownGate {
    pub fn new() -> Self {
        Self {
            state: QueueState::Running,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == QueueState::Terminated
    }

    /// Whether a task of `category` may enter the queue right now
    pub fn admits(&self, category: TaskCategory) -> bool {
        match self.state {
            QueueState::Running => true,
            QueueState::Terminated => !category.is_gated(),
        }
    }

    /// Move to `Terminated`. Returns `false` if the gate was already closed.
    pub fn terminate(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.state = QueueState::Terminated;
        true
    }
}

impl Default for ShutdownGate {
    fn default() -> Self {
        Self::new()
    }
}
