//! # TCB Store
//!
//! Fixed-capacity registry of every known task. Slot 0 permanently holds the
//! idle task; slots `1..MAX_TASKS` are handed out by [`TaskStore::allocate`]
//! and reclaimed by [`TaskStore::release`].
//!
//! The store only deals with slots and identities. Policy checks (ticket
//! validation, "still referenced" checks) happen in the scheduler, which
//! can see the other kernel objects.

use crate::config::MAX_TASKS;
use crate::error::Error;
use crate::task::{TaskConfig, TaskControlBlock, TaskId, TaskState};

pub struct TaskStore {
    tcbs: [TaskControlBlock; MAX_TASKS],
    /// Allocated slots, idle included.
    live: usize,
}

impl TaskStore {
    pub const fn new() -> Self {
        let mut tcbs = [TaskControlBlock::EMPTY; MAX_TASKS];
        tcbs[0] = TaskControlBlock::IDLE;
        Self { tcbs, live: 1 }
    }

    /// Claim a free slot and initialize it from `config`. The new task is
    /// Ready but has no stack frame yet.
    pub fn allocate(&mut self, config: TaskConfig) -> Result<TaskId, Error> {
        let (index, tcb) = self
            .tcbs
            .iter_mut()
            .enumerate()
            .skip(1)
            .find(|(_, tcb)| !tcb.active)
            .ok_or(Error::CapacityExceeded)?;

        let id = TaskId::new(index as u16, tcb.id.generation());
        tcb.init(id, config);
        self.live += 1;
        Ok(id)
    }

    /// Free a Terminated task's slot. Its stack becomes available to the
    /// next registration and `id` goes stale.
    pub fn release(&mut self, id: TaskId) -> Result<(), Error> {
        if id.is_idle() {
            return Err(Error::BadState);
        }
        let tcb = self.get_mut(id)?;
        if tcb.state != TaskState::Terminated {
            return Err(Error::BadState);
        }
        self.discard(id);
        Ok(())
    }

    /// Free a slot regardless of state. Used to roll back a registration
    /// that failed after allocation.
    pub(crate) fn discard(&mut self, id: TaskId) {
        let tcb = &mut self.tcbs[id.index()];
        if !tcb.active || tcb.id != id {
            return;
        }
        tcb.active = false;
        tcb.state = TaskState::Terminated;
        tcb.wait = None;
        tcb.wake_at = None;
        tcb.wake_reason = None;
        tcb.id = TaskId::new(id.index() as u16, id.generation().wrapping_add(1));
        self.live -= 1;
    }

    pub fn get(&self, id: TaskId) -> Result<&TaskControlBlock, Error> {
        match self.tcbs.get(id.index()) {
            Some(tcb) if tcb.active && tcb.id == id => Ok(tcb),
            _ => Err(Error::NoSuchObject),
        }
    }

    pub fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskControlBlock, Error> {
        match self.tcbs.get_mut(id.index()) {
            Some(tcb) if tcb.active && tcb.id == id => Ok(tcb),
            _ => Err(Error::NoSuchObject),
        }
    }

    /// `true` if `id` names a live task.
    #[inline]
    pub fn contains(&self, id: TaskId) -> bool {
        self.get(id).is_ok()
    }

    /// Allocated slots in slot order, idle first.
    pub fn iter(&self) -> impl Iterator<Item = &TaskControlBlock> {
        self.tcbs.iter().filter(|tcb| tcb.active)
    }

    /// Number of live tasks, idle included.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
