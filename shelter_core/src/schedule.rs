//! Cancelable scheduled tasks.
//!
//! Engines never own a live timer. They keep a [`TaskSlot`] holding at most
//! one [`ScheduledTask`] (an id plus a deadline on the context clock) and the
//! runtime asks them whether the deadline has passed. Scheduling always
//! replaces (cancels) whatever the slot held.

use shelter_env::TaskId;
use std::time::Duration;

/// A pending one-shot deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTask {
    pub id: TaskId,
    /// Context time at which the task fires
    pub due_at: Duration,
}

impl ScheduledTask {
    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.due_at
    }

    /// Time left until the deadline (zero once due).
    pub fn remaining(&self, now: Duration) -> Duration {
        self.due_at.saturating_sub(now)
    }
}

/// Holder for at most one pending task.
#[derive(Debug, Default)]
pub struct TaskSlot {
    pending: Option<ScheduledTask>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any pending task and schedules a new one `delay` after `now`.
    pub fn schedule(&mut self, now: Duration, delay: Duration) -> TaskId {
        self.cancel();
        let task = ScheduledTask {
            id: TaskId::new(),
            due_at: now + delay,
        };
        self.pending = Some(task);
        task.id
    }

    /// Drops the pending task, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Consumes the pending task if its deadline has passed.
    pub fn take_if_due(&mut self, now: Duration) -> Option<ScheduledTask> {
        match self.pending {
            Some(task) if task.is_due(now) => self.pending.take(),
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<&ScheduledTask> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn due_at(&self) -> Option<Duration> {
        self.pending.map(|t| t.due_at)
    }
}

/// Earliest of several optional deadlines.
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Duration>>) -> Option<Duration> {
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_replaces_pending() {
        let mut slot = TaskSlot::new();
        let first = slot.schedule(Duration::ZERO, Duration::from_secs(5));
        let second = slot.schedule(Duration::from_secs(1), Duration::from_secs(1));
        assert_ne!(first, second);
        assert_eq!(slot.due_at(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_take_if_due() {
        let mut slot = TaskSlot::new();
        slot.schedule(Duration::ZERO, Duration::from_millis(1500));
        assert!(slot.take_if_due(Duration::from_millis(1499)).is_none());
        assert!(slot.is_pending());
        assert!(slot.take_if_due(Duration::from_millis(1500)).is_some());
        assert!(!slot.is_pending());
        assert!(slot.take_if_due(Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_cancel() {
        let mut slot = TaskSlot::new();
        assert!(!slot.cancel());
        slot.schedule(Duration::ZERO, Duration::from_secs(1));
        assert!(slot.cancel());
        assert!(slot.take_if_due(Duration::from_secs(2)).is_none());
    }

    #[test]
    fn test_earliest() {
        let d = earliest([None, Some(Duration::from_secs(3)), Some(Duration::from_secs(1))]);
        assert_eq!(d, Some(Duration::from_secs(1)));
        assert_eq!(earliest([None, None]), None);
    }
}
