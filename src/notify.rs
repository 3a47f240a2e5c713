//! # Notification Channel
//!
//! Single-consumer signal/wait primitive. Any context may signal,
//! including timer callbacks; only the designated consumer task may wait.
//!
//! Pending signals are either coalesced or counted, chosen per channel at
//! creation:
//!
//! - [`NotifyMode::Binary`]: pending is 0 or 1. A second signal before the
//!   consumer waits is absorbed.
//! - [`NotifyMode::Counting`]: pending counts up to a limit; each wait
//!   consumes one. Signalling a full channel fails with `CapacityExceeded`
//!   and leaves the count unchanged.
//!
//! A signal that finds the consumer already blocked on the channel is
//! delivered to it directly and never becomes pending.

use core::fmt;

use crate::config::MAX_CHANNELS;
use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::{TaskId, WaitOn, WaitOutcome, WakeReason};
use crate::time::Timeout;

/// Channel identifier (index into the channel table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u16);

impl ChannelId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

/// How signals that arrive before a wait are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    Binary,
    /// Up to this many pending signals. Must be non-zero.
    Counting(u32),
}

impl NotifyMode {
    const fn limit(self) -> u32 {
        match self {
            NotifyMode::Binary => 1,
            NotifyMode::Counting(max) => max,
        }
    }
}

struct ChannelCb {
    allocated: bool,
    consumer: TaskId,
    mode: NotifyMode,
    pending: u32,
    /// The consumer is blocked in `channel_wait` on this channel.
    waiting: bool,
}

impl ChannelCb {
    const EMPTY: Self = Self {
        allocated: false,
        consumer: TaskId::IDLE,
        mode: NotifyMode::Binary,
        pending: 0,
        waiting: false,
    };
}

pub struct ChannelTable {
    cbs: [ChannelCb; MAX_CHANNELS],
}

impl ChannelTable {
    pub const fn new() -> Self {
        Self {
            cbs: [ChannelCb::EMPTY; MAX_CHANNELS],
        }
    }

    fn get(&self, id: ChannelId) -> Result<&ChannelCb, Error> {
        match self.cbs.get(id.index()) {
            Some(cb) if cb.allocated => Ok(cb),
            _ => Err(Error::NoSuchObject),
        }
    }

    fn get_mut(&mut self, id: ChannelId) -> Result<&mut ChannelCb, Error> {
        match self.cbs.get_mut(id.index()) {
            Some(cb) if cb.allocated => Ok(cb),
            _ => Err(Error::NoSuchObject),
        }
    }

    /// `true` if `task` is the consumer of any channel.
    pub fn is_consumer(&self, task: TaskId) -> bool {
        self.cbs
            .iter()
            .any(|cb| cb.allocated && cb.consumer == task)
    }

    /// The consumer gave up waiting (timeout path).
    pub(crate) fn cancel_wait(&mut self, id: ChannelId) {
        if let Ok(cb) = self.get_mut(id) {
            cb.waiting = false;
        }
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a channel that only `consumer` may wait on.
    pub fn channel_create(&mut self, consumer: TaskId, mode: NotifyMode) -> Result<ChannelId, Error> {
        if mode.limit() == 0 {
            return Err(Error::InvalidArgument);
        }
        if consumer.is_idle() {
            return Err(Error::BadContext);
        }
        self.tasks.get(consumer)?;

        let (index, cb) = self
            .channels
            .cbs
            .iter_mut()
            .enumerate()
            .find(|(_, cb)| !cb.allocated)
            .ok_or(Error::CapacityExceeded)?;
        *cb = ChannelCb {
            allocated: true,
            consumer,
            mode,
            pending: 0,
            waiting: false,
        };
        let id = ChannelId(index as u16);
        log::debug!("created {} for task {}", id, consumer);
        Ok(id)
    }

    /// Free a channel. Fails with `BadState` while its consumer is blocked
    /// on it.
    pub fn channel_delete(&mut self, id: ChannelId) -> Result<(), Error> {
        let cb = self.channels.get_mut(id)?;
        if cb.waiting {
            return Err(Error::BadState);
        }
        *cb = ChannelCb::EMPTY;
        log::debug!("deleted {}", id);
        Ok(())
    }

    /// Signal `id`. Never blocks; callable from task and tick context.
    pub fn channel_signal(&mut self, id: ChannelId) -> Result<(), Error> {
        let cb = self.channels.get_mut(id)?;
        if cb.waiting {
            cb.waiting = false;
            let consumer = cb.consumer;
            log::trace!("{} wakes task {}", id, consumer);
            self.wake(consumer, WakeReason::Signaled);
            return Ok(());
        }

        match cb.mode {
            NotifyMode::Binary => cb.pending = 1,
            NotifyMode::Counting(max) => {
                if cb.pending >= max {
                    log::warn!("{} is full ({} pending)", id, cb.pending);
                    return Err(Error::CapacityExceeded);
                }
                cb.pending += 1;
            }
        }
        Ok(())
    }

    /// First phase of a wait by `task`.
    ///
    /// `Completed` if a pending signal was consumed; `Blocked` if the task
    /// now waits, in which case `complete_wait` later reports `Ok(())` for a
    /// signal or `Err(TimedOut)`.
    pub fn channel_wait(
        &mut self,
        id: ChannelId,
        task: TaskId,
        timeout: Timeout,
    ) -> Result<WaitOutcome, Error> {
        let cb = self.channels.get_mut(id)?;
        if cb.consumer != task {
            return Err(Error::NotConsumer);
        }
        if cb.pending > 0 {
            cb.pending -= 1;
            return Ok(WaitOutcome::Completed);
        }
        if timeout.is_zero() {
            return Err(Error::TimedOut);
        }

        self.check_can_block(task)?;
        self.channels.get_mut(id)?.waiting = true;
        self.block_current(WaitOn::Channel(id), timeout);
        Ok(WaitOutcome::Blocked)
    }

    /// Signals received but not yet consumed.
    pub fn channel_pending(&self, id: ChannelId) -> Result<u32, Error> {
        Ok(self.channels.get(id)?.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::task::{TaskConfig, TaskState};

    fn noop(_: ()) {}

    /// A consumer at high priority and a producer below it. The consumer is
    /// running.
    fn setup() -> (Box<Scheduler>, TaskId, TaskId) {
        let mut s = Box::new(Scheduler::new(Policy::RoundRobin, 1));
        let consumer = s.register(TaskConfig::new("consumer", 5), noop, ()).unwrap();
        let producer = s.register(TaskConfig::new("producer", 2), noop, ()).unwrap();
        assert_eq!(s.schedule(), Ok(consumer));
        (s, consumer, producer)
    }

    #[test]
    fn test_signal_then_wait_returns_immediately() {
        let (mut s, consumer, _) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        s.channel_signal(ch).unwrap();
        assert_eq!(s.channel_pending(ch), Ok(1));

        assert_eq!(s.channel_wait(ch, consumer, Timeout::Forever), Ok(WaitOutcome::Completed));
        assert_eq!(s.channel_pending(ch), Ok(0));
        assert_eq!(s.task_state(consumer), Ok(TaskState::Running));
    }

    #[test]
    fn test_binary_signals_coalesce() {
        let (mut s, consumer, _) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        s.channel_signal(ch).unwrap();
        s.channel_signal(ch).unwrap();
        assert_eq!(s.channel_pending(ch), Ok(1));

        assert_eq!(s.channel_wait(ch, consumer, Timeout::Forever), Ok(WaitOutcome::Completed));
        assert_eq!(s.channel_wait(ch, consumer, Timeout::NONE), Err(Error::TimedOut));
    }

    #[test]
    fn test_counting_signals_accumulate_up_to_limit() {
        let (mut s, consumer, _) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Counting(2)).unwrap();
        s.channel_signal(ch).unwrap();
        s.channel_signal(ch).unwrap();
        assert_eq!(s.channel_signal(ch), Err(Error::CapacityExceeded));
        assert_eq!(s.channel_pending(ch), Ok(2));

        s.channel_wait(ch, consumer, Timeout::Forever).unwrap();
        assert_eq!(s.channel_pending(ch), Ok(1));
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let (mut s, consumer, _) = setup();
        assert_eq!(
            s.channel_create(consumer, NotifyMode::Counting(0)),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_only_consumer_may_wait() {
        let (mut s, consumer, producer) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        s.channel_signal(ch).unwrap();
        assert_eq!(
            s.channel_wait(ch, producer, Timeout::Forever),
            Err(Error::NotConsumer)
        );
        assert_eq!(s.channel_pending(ch), Ok(1));
    }

    #[test]
    fn test_wait_blocks_until_signal() {
        let (mut s, consumer, producer) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        assert_eq!(s.channel_wait(ch, consumer, Timeout::Forever), Ok(WaitOutcome::Blocked));
        assert_eq!(s.schedule(), Ok(producer));

        // Delivered straight to the blocked consumer, which outranks the
        // producer and preempts it.
        s.channel_signal(ch).unwrap();
        assert_eq!(s.channel_pending(ch), Ok(0));
        assert_eq!(s.task_state(consumer), Ok(TaskState::Ready));
        assert!(s.take_reschedule());
        assert_eq!(s.schedule(), Ok(consumer));
        assert_eq!(s.complete_wait(consumer), Ok(()));
    }

    #[test]
    fn test_wait_times_out() {
        let (mut s, consumer, _) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        s.channel_wait(ch, consumer, Timeout::Ticks(5)).unwrap();
        s.schedule().unwrap();
        for _ in 0..4 {
            s.tick();
            assert_eq!(s.task_state(consumer), Ok(TaskState::Blocked));
        }
        s.tick();
        assert_eq!(s.task_state(consumer), Ok(TaskState::Ready));
        assert_eq!(s.complete_wait(consumer), Err(Error::TimedOut));

        // The channel forgot the wait, so the next signal stays pending.
        s.channel_signal(ch).unwrap();
        assert_eq!(s.channel_pending(ch), Ok(1));
    }

    #[test]
    fn test_consumer_keeps_task_in_use() {
        let (mut s, consumer, _) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        s.exit_current().unwrap();
        s.schedule().unwrap();
        assert_eq!(s.deregister(consumer), Err(Error::InUse));

        s.channel_delete(ch).unwrap();
        s.deregister(consumer).unwrap();
    }

    #[test]
    fn test_delete_while_waiting_is_refused() {
        let (mut s, consumer, _) = setup();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        s.channel_wait(ch, consumer, Timeout::Forever).unwrap();
        assert_eq!(s.channel_delete(ch), Err(Error::BadState));
    }
}
