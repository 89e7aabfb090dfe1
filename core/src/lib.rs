/*!
# Lockstep Core

Core library for Lockstep, a serialized task queue for client libraries.

Network, timer and application callbacks submitted to a Lockstep queue never
interleave: task bodies run one at a time, in admission order, even when the
underlying executor is a thread pool.

This library provides:

- `AsyncQueue`, the FIFO admission and dispatch authority
- Cancelable, tag-addressable delayed operations (`DelayedOperation`)
- A one-way graceful shutdown that drops late work without errors
- Fail-fast detection of reentrant calls that would deadlock
- An `Executor` boundary with a tokio-backed default implementation
*/

pub mod error;
pub mod executor;
pub mod guard;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod task;

pub use error::{QueueError, Result};

pub use executor::{Executor, TimerToken, TokioExecutor};
pub use queue::{AsyncQueue, QueueConfig};
pub use scheduler::{DelayedOperation, TimerTag};
pub use shutdown::QueueState;
/// Re-export core types for convenience
pub use task::{Task, TaskCategory};
