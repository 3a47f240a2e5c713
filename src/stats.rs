//! # Statistics Collector
//!
//! Per-task execution counts and cumulative switch latency.
//!
//! - Every selection of a task counts as one execution of it, whether or
//!   not it was already running.
//! - A task giving up the CPU stamps the time. When the selector switches
//!   away from it, the gap between that stamp and the new dispatch is added
//!   to the cumulative latency. Time is in ticks, the finest clock the
//!   kernel keeps.
//!
//! All updates happen inside the scheduler's critical section, so a
//! [`Snapshot`] is always internally consistent: `total` equals the sum of
//! `counts`.

use crate::config::MAX_TASKS;
use crate::task::TaskId;
use crate::time::Tick;

/// Running counters, owned by the scheduler.
#[derive(Debug, Clone)]
pub struct Statistics {
    counts: [u32; MAX_TASKS],
    /// Task each slot's count belongs to.
    owners: [Option<TaskId>; MAX_TASKS],
    total: u32,
    cumulative_latency: Tick,
    /// When each slot's task last gave up the CPU, until consumed by the
    /// next switch away from it.
    released_at: [Option<Tick>; MAX_TASKS],
}

/// Copy of the counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Selections per task slot. Slot 0 is the idle task.
    pub counts: [u32; MAX_TASKS],
    /// Task each entry of `counts` belongs to.
    pub owners: [Option<TaskId>; MAX_TASKS],
    /// Sum of `counts`.
    pub total: u32,
    /// Ticks between a task giving up the CPU and the next dispatch,
    /// summed over all switches.
    pub cumulative_latency: Tick,
}

impl Snapshot {
    /// Selections of `task` since it was registered. `0` for an identifier
    /// whose slot has since been handed to another task.
    pub fn count(&self, task: TaskId) -> u32 {
        match self.owners.get(task.index()) {
            Some(&Some(owner)) if owner == task => self.counts[task.index()],
            _ => 0,
        }
    }

    /// Integer percentage of all selections that went to `task`.
    pub fn share_percent(&self, task: TaskId) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((self.count(task) as u64 * 100) / self.total as u64) as u32
    }
}

impl Statistics {
    pub const fn new() -> Self {
        let mut owners = [None; MAX_TASKS];
        owners[0] = Some(TaskId::IDLE);
        Self {
            counts: [0; MAX_TASKS],
            owners,
            total: 0,
            cumulative_latency: 0,
            released_at: [None; MAX_TASKS],
        }
    }

    /// `from` stopped running at `at` (blocked, yielded, exited or was
    /// preempted).
    pub fn on_release(&mut self, from: TaskId, at: Tick) {
        if let Some(slot) = self.released_at.get_mut(from.index()) {
            *slot = Some(at);
        }
    }

    /// The selector picked `to` at `at`, replacing `from` (`None` for the
    /// very first dispatch).
    pub fn on_switch(&mut self, from: Option<TaskId>, to: TaskId, at: Tick) {
        let released = from
            .and_then(|from| self.released_at.get_mut(from.index()))
            .and_then(Option::take);
        if let Some(released) = released {
            self.cumulative_latency = self
                .cumulative_latency
                .saturating_add(at.saturating_sub(released));
        }
        if to.index() >= MAX_TASKS {
            return;
        }
        if self.owners[to.index()] != Some(to) {
            self.reset_slot(to);
        }
        let count = &mut self.counts[to.index()];
        *count = count.wrapping_add(1);
        self.total = self.total.wrapping_add(1);
    }

    /// Forget a slot's count when a new task moves in.
    pub fn reset_slot(&mut self, task: TaskId) {
        if let Some(count) = self.counts.get_mut(task.index()) {
            self.total = self.total.wrapping_sub(*count);
            *count = 0;
            self.owners[task.index()] = Some(task);
        }
        if let Some(slot) = self.released_at.get_mut(task.index()) {
            *slot = None;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            counts: self.counts,
            owners: self.owners,
            total: self.total,
            cumulative_latency: self.cumulative_latency,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}
