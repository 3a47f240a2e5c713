//! # Mutex Service
//!
//! Exclusive-ownership locks with a FIFO wait set.
//!
//! - Acquire on an unowned mutex succeeds immediately.
//! - Acquire on an owned mutex appends the caller to the wait set and blocks
//!   it, bounded by a [`Timeout`].
//! - Release hands ownership straight to the head of the wait set, so the
//!   first task to block is the first to be granted. Nobody can barge in
//!   between release and the waiter running.
//! - On timeout the waiter is removed from the wait set; ownership is not
//!   touched.
//!
//! There is no priority inheritance. The wait set is a plain FIFO; a
//! protocol that reorders waiters would only change where `push` inserts.

use core::fmt;

use heapless::Vec;

use crate::config::{MAX_MUTEXES, MAX_TASKS};
use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::{TaskId, WaitOn, WaitOutcome, WakeReason};
use crate::time::Timeout;

/// Mutex identifier (index into the mutex table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(u16);

impl MutexId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutex#{}", self.0)
    }
}

/// *Mutex control block*.
pub struct MutexCb {
    allocated: bool,
    owner: Option<TaskId>,
    /// Blocked acquirers, oldest first. Non-owning.
    waiters: Vec<TaskId, MAX_TASKS>,
}

impl MutexCb {
    const EMPTY: Self = Self {
        allocated: false,
        owner: None,
        waiters: Vec::new(),
    };
}

pub struct MutexTable {
    cbs: [MutexCb; MAX_MUTEXES],
}

impl MutexTable {
    pub const fn new() -> Self {
        Self {
            cbs: [MutexCb::EMPTY; MAX_MUTEXES],
        }
    }

    fn allocate(&mut self) -> Result<MutexId, Error> {
        let (index, cb) = self
            .cbs
            .iter_mut()
            .enumerate()
            .find(|(_, cb)| !cb.allocated)
            .ok_or(Error::CapacityExceeded)?;
        *cb = MutexCb::EMPTY;
        cb.allocated = true;
        Ok(MutexId(index as u16))
    }

    fn get(&self, id: MutexId) -> Result<&MutexCb, Error> {
        match self.cbs.get(id.index()) {
            Some(cb) if cb.allocated => Ok(cb),
            _ => Err(Error::NoSuchObject),
        }
    }

    fn get_mut(&mut self, id: MutexId) -> Result<&mut MutexCb, Error> {
        match self.cbs.get_mut(id.index()) {
            Some(cb) if cb.allocated => Ok(cb),
            _ => Err(Error::NoSuchObject),
        }
    }

    /// `true` if `task` owns any mutex.
    pub fn owns_any(&self, task: TaskId) -> bool {
        self.cbs
            .iter()
            .any(|cb| cb.allocated && cb.owner == Some(task))
    }

    /// Drop `task` from a wait set (timeout path).
    pub(crate) fn remove_waiter(&mut self, id: MutexId, task: TaskId) {
        if let Ok(cb) = self.get_mut(id) {
            cb.waiters.retain(|&w| w != task);
        }
    }
}

impl Default for MutexTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an unowned mutex.
    pub fn mutex_create(&mut self) -> Result<MutexId, Error> {
        let id = self.mutexes.allocate()?;
        log::debug!("created {}", id);
        Ok(id)
    }

    /// First phase of an acquire by `task`.
    ///
    /// Returns `Completed` if `task` now owns the mutex, or `Blocked` if it
    /// was queued; in that case `complete_wait` later yields `Ok(())` once
    /// ownership was handed over, or `Err(TimedOut)`.
    pub fn mutex_acquire(
        &mut self,
        id: MutexId,
        task: TaskId,
        timeout: Timeout,
    ) -> Result<WaitOutcome, Error> {
        self.tasks.get(task)?;
        let cb = self.mutexes.get_mut(id)?;
        match cb.owner {
            None => {
                cb.owner = Some(task);
                return Ok(WaitOutcome::Completed);
            }
            Some(owner) if owner == task => return Err(Error::AlreadyOwned),
            Some(_) if timeout.is_zero() => return Err(Error::TimedOut),
            Some(_) => {}
        }

        self.check_can_block(task)?;
        let cb = self.mutexes.get_mut(id)?;
        cb.waiters.push(task).map_err(|_| Error::CapacityExceeded)?;
        self.block_current(WaitOn::Mutex(id), timeout);
        log::trace!("task {} waits for {}", task, id);
        Ok(WaitOutcome::Blocked)
    }

    /// Release by `task`. Ownership moves to the oldest waiter, which
    /// becomes Ready, or the mutex becomes unowned.
    pub fn mutex_release(&mut self, id: MutexId, task: TaskId) -> Result<(), Error> {
        let cb = self.mutexes.get_mut(id)?;
        if cb.owner != Some(task) {
            log::warn!("task {} released {} without owning it", task, id);
            return Err(Error::NotOwner);
        }

        if cb.waiters.is_empty() {
            cb.owner = None;
            return Ok(());
        }
        let next = cb.waiters.remove(0);
        cb.owner = Some(next);
        log::trace!("{} handed from {} to {}", id, task, next);
        self.wake(next, WakeReason::Granted);
        Ok(())
    }

    /// Current owner, if any.
    pub fn mutex_owner(&self, id: MutexId) -> Result<Option<TaskId>, Error> {
        Ok(self.mutexes.get(id)?.owner)
    }

    /// Number of tasks blocked on `id`.
    pub fn mutex_waiters(&self, id: MutexId) -> Result<usize, Error> {
        Ok(self.mutexes.get(id)?.waiters.len())
    }
}
