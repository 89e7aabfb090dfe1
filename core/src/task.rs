/*!
# Task Module

This module defines the unit of work accepted by Lockstep queues.

A task is an opaque, zero-argument closure. The queue never inspects it; it
only decides whether to admit it and when to run it. That decision depends on
the task's category:

- `Normal` tasks are the default and are dropped once shutdown begins
- `Relaxed` tasks behave like `Normal` but may be submitted from inside the queue
- `PostShutdown` tasks are admitted no matter the shutdown state
*/

use std::fmt;

/// A unit of work run by the queue
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Admission category of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    /// Regular work, including delayed tasks once they fire
    Normal,
    /// Regular work submitted without the reentrancy check
    Relaxed,
    /// Work that must run even after shutdown was initiated
    PostShutdown,
}

impl TaskCategory {
    /// Whether tasks of this category are dropped once the queue terminates
    pub fn is_gated(self) -> bool {
        !matches!(self, Self::PostShutdown)
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Normal => "normal",
            Self::Relaxed => "relaxed",
            Self::PostShutdown => "post-shutdown",
        };
        f.write_str(label)
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_post_shutdown_bypasses_the_gate() {
        assert!(TaskCategory::Normal.is_gated());
        assert!(TaskCategory::Relaxed.is_gated());
        assert!(!TaskCategory::PostShutdown.is_gated());
    }

    #[test]
    fn panic_message_reads_both_payload_kinds() {
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }
}
