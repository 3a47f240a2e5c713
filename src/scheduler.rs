//! # Scheduler
//!
//! The single owned arena behind the kernel: task store, selector state,
//! mutexes, timers, channels and statistics, all reachable only through
//! `&mut Scheduler`. `kernel.rs` keeps the one global instance inside a
//! critical-section mutex; tests build their own instances and drive them
//! directly.
//!
//! ## Scheduling Algorithm
//!
//! At each SysTick interrupt ([`Scheduler::tick`]):
//! 1. **Advance time** and wake tasks whose bounded wait expired
//! 2. **Fire timers** whose deadline was reached, in creation order
//! 3. **Decrement time slice**: on expiry, request a reschedule if a peer
//!    is eligible
//!
//! Whenever a reschedule is pending, the port runs [`Scheduler::schedule`]
//! from PendSV:
//! 1. **Check the outgoing stack canary**; a damaged canary halts the
//!    scheduler
//! 2. **Demote** the outgoing task from Running to Ready, if it still runs
//! 3. **Select** per policy, falling back to the idle task
//! 4. **Record** the switch with the statistics collector
//!
//! ## Preemption
//!
//! A task that becomes Ready with a priority strictly above the running
//! task's (round-robin), or any task that becomes Ready while idle runs,
//! sets the reschedule flag immediately. The caller (ISR or kernel API)
//! then pends the context switch, so the switch happens before the next
//! tick.

use heapless::Vec;

use crate::config::{MAX_TASKS, MAX_TOTAL_TICKETS, STACK_SIZE};
use crate::error::{Error, Fatal, FatalKind};
use crate::mutex::MutexTable;
use crate::notify::ChannelTable;
use crate::policy::{self, Policy};
use crate::rng::Xorshift32;
use crate::stats::{Snapshot, Statistics};
use crate::store::TaskStore;
use crate::task::{TaskConfig, TaskId, TaskState, WaitOn, WaitOutcome, WakeReason};
use crate::time::{Tick, Timeout};
use crate::timer::TimerTable;

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

pub struct Scheduler {
    pub(crate) tasks: TaskStore,
    policy: Policy,
    rng: Xorshift32,
    /// Dispatch sequence number, stamped into `last_run` on every selection.
    seq: u64,
    pub(crate) mutexes: MutexTable,
    pub(crate) timers: TimerTable,
    pub(crate) channels: ChannelTable,
    stats: Statistics,
    /// The Running task, or the task that was running when it blocked,
    /// yielded or exited and has not been switched out yet.
    current: TaskId,
    tick_count: Tick,
    needs_reschedule: bool,
    started: bool,
    halted: Option<Fatal>,
}

impl Scheduler {
    /// An empty scheduler: only the idle task, nothing running yet.
    pub const fn new(policy: Policy, seed: u32) -> Self {
        Self {
            tasks: TaskStore::new(),
            policy,
            rng: Xorshift32::new(seed),
            seq: 0,
            mutexes: MutexTable::new(),
            timers: TimerTable::new(),
            channels: ChannelTable::new(),
            stats: Statistics::new(),
            current: TaskId::IDLE,
            tick_count: 0,
            needs_reschedule: false,
            started: false,
            halted: None,
        }
    }

    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    #[inline]
    pub fn current(&self) -> TaskId {
        self.current
    }

    /// Ticks since the scheduler was created.
    #[inline]
    pub fn now(&self) -> Tick {
        self.tick_count
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// The fatal condition that stopped the scheduler, if any.
    #[inline]
    pub fn halted(&self) -> Option<Fatal> {
        self.halted
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn task_state(&self, id: TaskId) -> Result<TaskState, Error> {
        Ok(self.tasks.get(id)?.state)
    }

    pub fn stats(&self) -> Snapshot {
        self.stats.snapshot()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a task that will run `entry(param)`. The task starts Ready.
    ///
    /// # Errors
    /// - `CapacityExceeded`: the task table is full, or `config.stack_size`
    ///   exceeds a stack slot
    /// - `InvalidTicketCount`: lottery policy and a zero ticket count, or
    ///   the live ticket sum would exceed `MAX_TOTAL_TICKETS`
    /// - `InvalidArgument`: the payload and initial frame don't fit the
    ///   requested stack
    pub fn register<P: Send + 'static>(
        &mut self,
        config: TaskConfig,
        entry: fn(P),
        param: P,
    ) -> Result<TaskId, Error> {
        if config.stack_size > STACK_SIZE {
            return Err(Error::CapacityExceeded);
        }
        if self.policy == Policy::Lottery {
            if config.tickets == 0 {
                return Err(Error::InvalidTicketCount);
            }
            self.check_ticket_budget(None, config.tickets)?;
        }

        let id = self.tasks.allocate(config)?;
        if let Err(e) = self.tasks.get_mut(id).and_then(|tcb| tcb.launch(entry, param)) {
            self.tasks.discard(id);
            return Err(e);
        }
        self.stats.reset_slot(id);
        log::debug!(
            "registered task {} ({}), priority {}, tickets {}",
            id,
            config.name,
            config.priority,
            config.tickets
        );

        self.preempt_check(id);
        Ok(id)
    }

    /// Free a Terminated task's slot.
    ///
    /// # Errors
    /// - `BadState`: the task is not Terminated, or is the idle task
    /// - `InUse`: it still owns a mutex or consumes a channel
    pub fn deregister(&mut self, id: TaskId) -> Result<(), Error> {
        if self.tasks.get(id)?.state != TaskState::Terminated || id.is_idle() {
            return Err(Error::BadState);
        }
        if self.mutexes.owns_any(id) || self.channels.is_consumer(id) {
            return Err(Error::InUse);
        }
        self.tasks.release(id)?;
        log::debug!("deregistered task {}", id);
        Ok(())
    }

    /// Change a task's ticket count. `0` parks the task out of the lottery
    /// without removing it.
    pub fn set_tickets(&mut self, id: TaskId, tickets: u32) -> Result<(), Error> {
        if id.is_idle() {
            return Err(Error::BadState);
        }
        self.tasks.get(id)?;
        if self.policy == Policy::Lottery {
            self.check_ticket_budget(Some(id), tickets)?;
        }
        self.tasks.get_mut(id)?.config.tickets = tickets;
        log::debug!("task {} now holds {} tickets", id, tickets);
        Ok(())
    }

    /// Would the live ticket sum stay within bounds if `id` (or a new task,
    /// for `None`) held `tickets`?
    fn check_ticket_budget(&self, id: Option<TaskId>, tickets: u32) -> Result<(), Error> {
        let others: u64 = self
            .tasks
            .iter()
            .filter(|tcb| tcb.state != TaskState::Terminated && Some(tcb.id) != id)
            .map(|tcb| tcb.config.tickets as u64)
            .sum();
        if others + tickets as u64 > MAX_TOTAL_TICKETS as u64 {
            return Err(Error::InvalidTicketCount);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Selection and dispatch
    // -----------------------------------------------------------------------

    /// Ready-Set Selector entry point: the next task per policy, or the idle
    /// task if nothing is eligible. Never returns a Blocked or Terminated
    /// task.
    pub fn select_next(&mut self) -> TaskId {
        let picked = match self.policy {
            Policy::RoundRobin => policy::select_round_robin(&self.tasks),
            Policy::Lottery => policy::select_lottery(&self.tasks, &mut self.rng),
        };
        picked.unwrap_or(TaskId::IDLE)
    }

    /// Switch out the current task and switch in the next one.
    ///
    /// Returns the task that now runs. Fails once a fatal condition has
    /// been detected; the scheduler then refuses to dispatch anything.
    pub fn schedule(&mut self) -> Result<TaskId, Fatal> {
        if let Some(fatal) = self.halted {
            return Err(fatal);
        }
        let prev = self.current;
        let now = self.tick_count;

        if self.started {
            if let Ok(tcb) = self.tasks.get_mut(prev) {
                // Stack pointer 0 means the task never had a frame (the
                // idle task on a host).
                if tcb.stack_pointer != 0 && !tcb.stack_intact() {
                    let fatal = Fatal::new(FatalKind::StackOverflow, Some(prev), tcb.name());
                    return Err(self.fail(fatal));
                }
                if tcb.state == TaskState::Running {
                    tcb.state = TaskState::Ready;
                    self.stats.on_release(prev, now);
                }
            }
        }

        let next = self.select_next();
        self.seq += 1;
        let seq = self.seq;
        let Ok(tcb) = self.tasks.get_mut(next) else {
            let fatal = Fatal::new(FatalKind::InvariantViolation, Some(next), "");
            return Err(self.fail(fatal));
        };
        if next != prev || tcb.ticks_remaining == 0 {
            tcb.ticks_remaining = tcb.config.effective_time_slice();
        }
        tcb.state = TaskState::Running;
        tcb.last_run = seq;

        let from = if self.started { Some(prev) } else { None };
        self.stats.on_switch(from, next, now);
        if next != prev {
            log::trace!("switch {} -> {} at {}", prev, next, now);
        }

        self.current = next;
        self.started = true;
        self.needs_reschedule = false;
        Ok(next)
    }

    /// Record a fatal condition and stop dispatching.
    pub fn fail(&mut self, fatal: Fatal) -> Fatal {
        log::error!("scheduler halted: {}", fatal);
        self.halted = Some(fatal);
        self.needs_reschedule = false;
        fatal
    }

    /// `true` if a context switch is pending. Clears the flag.
    pub fn take_reschedule(&mut self) -> bool {
        core::mem::replace(&mut self.needs_reschedule, false)
    }

    #[inline]
    pub fn needs_reschedule(&self) -> bool {
        self.needs_reschedule
    }

    /// Request a reschedule if `woken` should run before the current task.
    fn preempt_check(&mut self, woken: TaskId) {
        if !self.started {
            return;
        }
        let Ok(cur) = self.tasks.get(self.current) else {
            self.needs_reschedule = true;
            return;
        };
        if cur.state != TaskState::Running || cur.id.is_idle() {
            self.needs_reschedule = true;
            return;
        }
        if self.policy == Policy::RoundRobin {
            if let Ok(tcb) = self.tasks.get(woken) {
                if tcb.is_runnable() && tcb.config.priority > cur.config.priority {
                    self.needs_reschedule = true;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tick processing
    // -----------------------------------------------------------------------

    /// Called from the SysTick handler every tick. Sets the reschedule flag
    /// if a context switch should occur.
    pub fn tick(&mut self) {
        self.tick_count += 1;
        let now = self.tick_count;

        // --- Expire bounded waits ---
        let mut expired: Vec<(TaskId, WaitOn), MAX_TASKS> = Vec::new();
        for tcb in self.tasks.iter() {
            if tcb.state != TaskState::Blocked {
                continue;
            }
            if let (Some(deadline), Some(wait)) = (tcb.wake_at, tcb.wait) {
                if deadline <= now {
                    let _ = expired.push((tcb.id, wait));
                }
            }
        }
        for (id, wait) in expired {
            let reason = match wait {
                WaitOn::Mutex(m) => {
                    self.mutexes.remove_waiter(m, id);
                    WakeReason::TimedOut
                }
                WaitOn::Channel(c) => {
                    self.channels.cancel_wait(c);
                    WakeReason::TimedOut
                }
                WaitOn::Delay => WakeReason::Elapsed,
            };
            if reason == WakeReason::TimedOut {
                log::warn!("task {} timed out waiting for {:?}", id, wait);
            }
            self.wake(id, reason);
        }

        // --- Software timers ---
        self.process_timers();

        // --- Time slice of the running task ---
        if !self.started {
            return;
        }
        let current = self.current;
        let Ok(tcb) = self.tasks.get_mut(current) else {
            return;
        };
        if tcb.state != TaskState::Running {
            return;
        }
        if current.is_idle() {
            if self.tasks.iter().any(|t| t.is_runnable() && !t.id.is_idle()) {
                self.needs_reschedule = true;
            }
            return;
        }

        tcb.ticks_remaining = tcb.ticks_remaining.saturating_sub(1);
        if tcb.ticks_remaining > 0 {
            return;
        }
        tcb.ticks_remaining = tcb.config.effective_time_slice();
        let priority = tcb.config.priority;
        let peer_waiting = self.tasks.iter().any(|t| {
            t.is_runnable()
                && !t.id.is_idle()
                && (self.policy == Policy::Lottery || t.config.priority >= priority)
        });
        if peer_waiting {
            self.needs_reschedule = true;
        }
    }

    // -----------------------------------------------------------------------
    // Blocking and waking
    // -----------------------------------------------------------------------

    /// May `task` block right now? Only the running task, never idle, and
    /// only once the scheduler has started.
    pub(crate) fn check_can_block(&self, task: TaskId) -> Result<(), Error> {
        if !self.started || task.is_idle() || task != self.current {
            return Err(Error::BadContext);
        }
        match self.tasks.get(task)?.state {
            TaskState::Running => Ok(()),
            _ => Err(Error::BadContext),
        }
    }

    /// Put the current task into Blocked and request a switch. Callers
    /// check [`Self::check_can_block`] first.
    pub(crate) fn block_current(&mut self, wait: WaitOn, timeout: Timeout) {
        let now = self.tick_count;
        let current = self.current;
        if let Ok(tcb) = self.tasks.get_mut(current) {
            tcb.block(wait, timeout.deadline(now));
            self.stats.on_release(current, now);
            self.needs_reschedule = true;
        }
    }

    /// Blocked → Ready. No effect on a task that is not Blocked.
    pub(crate) fn wake(&mut self, id: TaskId, reason: WakeReason) {
        match self.tasks.get_mut(id) {
            Ok(tcb) if tcb.state == TaskState::Blocked => tcb.wake(reason),
            _ => return,
        }
        log::trace!("task {} woken ({:?})", id, reason);
        self.preempt_check(id);
    }

    /// Second phase of a blocking call: the result the waker left for `id`.
    pub fn complete_wait(&mut self, id: TaskId) -> Result<(), Error> {
        match self.tasks.get_mut(id)?.wake_reason.take() {
            Some(WakeReason::Granted | WakeReason::Signaled | WakeReason::Elapsed) => Ok(()),
            Some(WakeReason::TimedOut) => Err(Error::TimedOut),
            None => Err(Error::BadState),
        }
    }

    // -----------------------------------------------------------------------
    // Task-facing operations on the current task
    // -----------------------------------------------------------------------

    /// Give up the CPU. The task stays Ready and goes behind its
    /// equal-priority peers.
    pub fn yield_current(&mut self) {
        let now = self.tick_count;
        let current = self.current;
        if let Ok(tcb) = self.tasks.get_mut(current) {
            if tcb.state == TaskState::Running {
                tcb.state = TaskState::Ready;
                tcb.ticks_remaining = tcb.config.effective_time_slice();
                self.stats.on_release(current, now);
            }
        }
        self.needs_reschedule = true;
    }

    /// Block the current task for `ticks` ticks. `0` is a plain yield.
    pub fn delay_current(&mut self, ticks: u32) -> Result<WaitOutcome, Error> {
        if ticks == 0 {
            self.yield_current();
            return Ok(WaitOutcome::Completed);
        }
        self.check_can_block(self.current)?;
        self.block_current(WaitOn::Delay, Timeout::Ticks(ticks));
        Ok(WaitOutcome::Blocked)
    }

    /// Terminate the current task. Its slot stays allocated until
    /// [`Self::deregister`].
    pub fn exit_current(&mut self) -> Result<(), Error> {
        let now = self.tick_count;
        let current = self.current;
        if current.is_idle() || !self.started {
            return Err(Error::BadContext);
        }
        let tcb = self.tasks.get_mut(current)?;
        tcb.state = TaskState::Terminated;
        log::debug!("task {} ({}) exited", current, tcb.name());
        self.stats.on_release(current, now);
        self.needs_reschedule = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Port support
    // -----------------------------------------------------------------------

    /// Give the idle task a frame that enters `entry`.
    pub(crate) fn launch_idle(&mut self, entry: fn(())) -> Result<(), Error> {
        self.tasks.get_mut(TaskId::IDLE)?.launch(entry, ())
    }

    /// Saved stack pointer of `id`.
    pub(crate) fn stack_pointer(&self, id: TaskId) -> Result<usize, Error> {
        Ok(self.tasks.get(id)?.stack_pointer)
    }

    /// Store the outgoing task's stack pointer before [`Self::schedule`].
    pub(crate) fn save_stack_pointer(&mut self, sp: usize) {
        if let Ok(tcb) = self.tasks.get_mut(self.current) {
            tcb.stack_pointer = sp;
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
