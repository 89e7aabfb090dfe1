/*!
# Scheduler Module

This module defines delayed-operation bookkeeping for Lockstep.

The `DelayedScheduler` owns every pending delayed task, ordered by
`(target time, sequence number)`. That order alone decides which task fires
first. A task leaves the table exactly once: either it fires and is handed to
the queue's FIFO, or it is canceled. Both happen under the queue's lock, so a
cancellation that finds the entry gone is simply too late and does nothing.

Callers hold a `DelayedOperation`, which names the entry by key and reaches
its queue through a weak reference. It owns nothing, so it can outlive both
the entry and the queue.
*/

use crate::executor::TimerToken;
use crate::task::Task;
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Weak;
use std::time::Instant;

/// Identifier classifying a delayed operation.
///
/// The surrounding system defines the actual values, typically as a
/// fieldless enum. `ALL` is reserved and matches every pending operation.
pub trait TimerTag: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const ALL: Self;

    fn is_all(&self) -> bool {
        *self == Self::ALL
    }
}

/// Position of a delayed task in firing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScheduleKey {
    target: Instant,
    seq: u64,
}

impl ScheduleKey {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    // Smallest key ordered after this one; sequence numbers are unique.
    fn successor(&self) -> Self {
        Self {
            target: self.target,
            seq: self.seq + 1,
        }
    }
}

/// A task waiting for its target time
pub struct ScheduledTask<T> {
    pub key: ScheduleKey,
    pub tag: T,
    pub task: Task,
    pub timer: Option<TimerToken>,
}

impl<T: fmt::Debug> fmt::Debug for ScheduledTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("key", &self.key)
            .field("tag", &self.tag)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

/// Pending delayed tasks, ordered by `(target time, sequence number)`
pub struct DelayedScheduler<T> {
    pending: BTreeMap<ScheduleKey, ScheduledTask<T>>,
    next_seq: u64,
}

impl<T: TimerTag> DelayedScheduler<T> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Store a pending task and return its key
    pub fn schedule(&mut self, target: Instant, tag: T, task: Task) -> ScheduleKey {
        let key = ScheduleKey {
            target,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.pending.insert(
            key,
            ScheduledTask {
                key,
                tag,
                task,
                timer: None,
            },
        );
        key
    }

    /// Record the timer armed for `key`.
    ///
    /// Returns `false` if the task already left the table, in which case the
    /// caller owns the token and should disarm it.
    pub fn attach_timer(&mut self, key: ScheduleKey, token: TimerToken) -> bool {
        match self.pending.get_mut(&key) {
            Some(entry) => {
                entry.timer = Some(token);
                true
            }
            None => false,
        }
    }

    /// Remove a still-pending task
    pub fn cancel(&mut self, key: ScheduleKey) -> Option<ScheduledTask<T>> {
        self.pending.remove(&key)
    }

    /// Remove every pending task ordered at or before `boundary`, earliest first
    pub fn take_through(&mut self, boundary: ScheduleKey) -> Vec<ScheduledTask<T>> {
        let later = self.pending.split_off(&boundary.successor());
        let due = mem::replace(&mut self.pending, later);
        due.into_values().collect()
    }

    /// Remove every pending task, earliest first
    pub fn take_all(&mut self) -> Vec<ScheduledTask<T>> {
        mem::take(&mut self.pending).into_values().collect()
    }

    /// The key a forced drain for `tag` runs through.
    ///
    /// For `ALL` this is the latest pending task; otherwise the earliest
    /// pending task carrying `tag`.
    pub fn drain_boundary(&self, tag: T) -> Option<ScheduleKey> {
        if tag.is_all() {
            return self.pending.keys().next_back().copied();
        }
        self.pending
            .values()
            .find(|entry| entry.tag == tag)
            .map(|entry| entry.key)
    }

    /// Whether a pending task carries exactly `tag`.
    ///
    /// `ALL` is compared like any other tag here; only the drain treats it as
    /// a wildcard.
    pub fn is_scheduled(&self, tag: T) -> bool {
        self.pending.values().any(|entry| entry.tag == tag)
    }

    pub fn contains(&self, key: ScheduleKey) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T: TimerTag> Default for DelayedScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that can cancel the delayed task behind a key
pub(crate) trait CancelScheduled: Send + Sync {
    fn cancel_scheduled(&self, key: ScheduleKey);
}

/// Handle to a delayed operation, used to cancel it before it fires.
///
/// The default handle refers to nothing and its `cancel` does nothing.
#[derive(Clone, Default)]
pub struct DelayedOperation {
    target: Option<(ScheduleKey, Weak<dyn CancelScheduled>)>,
}

impl DelayedOperation {
    pub(crate) fn new(key: ScheduleKey, owner: Weak<dyn CancelScheduled>) -> Self {
        Self {
            target: Some((key, owner)),
        }
    }

    /// Prevent the operation from running if it has not fired yet.
    ///
    /// Safe from any thread, any number of times; after the operation fired
    /// or its queue was dropped this is a no-op.
    pub fn cancel(&self) {
        if let Some((key, owner)) = &self.target {
            if let Some(owner) = owner.upgrade() {
                owner.cancel_scheduled(*key);
            }
        }
    }

    pub fn key(&self) -> Option<ScheduleKey> {
        self.target.as_ref().map(|(key, _)| *key)
    }
}

impl fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("key", &self.key())
            .finish()
    }
}
