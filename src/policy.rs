//! # Ready-Set Selector
//!
//! Chooses the next task to run. Two policies, fixed per scheduler instance:
//!
//! ## Policy A: fixed-priority round-robin
//!
//! Among Ready tasks, only the highest priority present is considered.
//! Within that level the task that was dispatched least recently wins
//! (never-dispatched tasks first, then slot order), so peers rotate in
//! strict FIFO order and none is skipped twice in a row.
//!
//! ## Policy B: ticket-weighted (lottery)
//!
//! ```text
//!   Ready:   T1 (94)          T2 (5)   T3 (1)
//!          ├────────────────┼────────┼──┤
//!          0               94       99 100
//!                   ▲
//!                 draw ∈ [0, 100)
//! ```
//!
//! Sum the tickets of exactly the Ready tasks, draw uniformly in
//! `[0, total)`, and walk the Ready set in slot order until the draw falls
//! inside a task's cumulative range. A task with zero tickets has an empty
//! range and is never picked. Priorities are ignored.
//!
//! Both selectors are O(number of tasks) and run inside the scheduler's
//! critical section.

use crate::rng::TicketSource;
use crate::store::TaskStore;
use crate::task::{TaskControlBlock, TaskId};

/// Scheduling policy of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Fixed-priority preemptive, round-robin among equal priorities.
    RoundRobin,
    /// Probabilistic, proportional to ticket counts.
    Lottery,
}

/// Tasks the selector may pick. The idle task is the fallback, never a
/// candidate.
#[inline]
fn candidates(store: &TaskStore) -> impl Iterator<Item = &TaskControlBlock> {
    store
        .iter()
        .filter(|tcb| tcb.is_runnable() && !tcb.id.is_idle())
}

/// Policy A. `None` if nothing is Ready.
pub fn select_round_robin(store: &TaskStore) -> Option<TaskId> {
    let top = candidates(store).map(|tcb| tcb.config.priority).max()?;
    candidates(store)
        .filter(|tcb| tcb.config.priority == top)
        .min_by_key(|tcb| (tcb.last_run, tcb.id.index()))
        .map(|tcb| tcb.id)
}

/// Policy B. `None` if nothing is Ready or every Ready task holds zero
/// tickets.
pub fn select_lottery<R: TicketSource>(store: &TaskStore, source: &mut R) -> Option<TaskId> {
    let total: u64 = candidates(store).map(|tcb| tcb.config.tickets as u64).sum();
    if total == 0 {
        return None;
    }
    // Registration caps the ticket sum well below `u32::MAX`.
    let total = u32::try_from(total).ok()?;
    let winner = source.draw(total) as u64;

    let mut cumulative = 0u64;
    for tcb in candidates(store) {
        cumulative += tcb.config.tickets as u64;
        if winner < cumulative {
            return Some(tcb.id);
        }
    }
    None
}
