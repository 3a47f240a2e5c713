//! # Timer Service
//!
//! Software timers driven by the scheduler tick.
//!
//! On every tick, each enabled timer whose deadline has been reached fires:
//! its callback runs synchronously in tick context, then a recurring timer
//! moves its deadline forward by one period and a one-shot timer disables
//! itself. Timers that expire on the same tick fire in creation order.
//!
//! Callbacks receive an [`IsrContext`], not the scheduler. It only offers
//! non-blocking operations, so a callback cannot acquire a mutex or sleep.

use core::fmt;

use heapless::Vec;

use crate::config::MAX_TIMERS;
use crate::error::Error;
use crate::notify::ChannelId;
use crate::scheduler::Scheduler;
use crate::time::Tick;

/// Timer identifier (index into the timer table, i.e. creation order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u16);

impl TimerId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Timer expiry callback. Runs in tick context.
pub type TimerCallback = fn(&mut IsrContext<'_>);

/// What a timer callback may do.
pub struct IsrContext<'a> {
    sched: &'a mut Scheduler,
    timer: TimerId,
}

impl IsrContext<'_> {
    /// The timer that fired.
    pub fn timer(&self) -> TimerId {
        self.timer
    }

    /// Current tick.
    pub fn now(&self) -> Tick {
        self.sched.now()
    }

    /// Signal a notification channel.
    pub fn signal(&mut self, channel: ChannelId) -> Result<(), Error> {
        self.sched.channel_signal(channel)
    }
}

#[derive(Clone, Copy)]
struct TimerCb {
    allocated: bool,
    period: u32,
    recurring: bool,
    callback: Option<TimerCallback>,
    enabled: bool,
    deadline: Tick,
}

impl TimerCb {
    const EMPTY: Self = Self {
        allocated: false,
        period: 0,
        recurring: false,
        callback: None,
        enabled: false,
        deadline: 0,
    };
}

pub struct TimerTable {
    cbs: [TimerCb; MAX_TIMERS],
}

impl TimerTable {
    pub const fn new() -> Self {
        Self {
            cbs: [TimerCb::EMPTY; MAX_TIMERS],
        }
    }

    fn get_mut(&mut self, id: TimerId) -> Result<&mut TimerCb, Error> {
        match self.cbs.get_mut(id.index()) {
            Some(cb) if cb.allocated => Ok(cb),
            _ => Err(Error::NoSuchObject),
        }
    }

    /// Collect the timers due at `now`, in creation order, and advance or
    /// disable each one.
    fn expire(&mut self, now: Tick) -> Vec<(TimerId, TimerCallback), MAX_TIMERS> {
        let mut due = Vec::new();
        for (index, cb) in self.cbs.iter_mut().enumerate() {
            if !cb.allocated || !cb.enabled || cb.deadline > now {
                continue;
            }
            if cb.recurring {
                cb.deadline += cb.period as Tick;
                if cb.deadline <= now {
                    // Missed more than a whole period; realign instead of
                    // firing a burst.
                    cb.deadline = now + cb.period as Tick;
                }
            } else {
                cb.enabled = false;
            }
            if let Some(callback) = cb.callback {
                // Capacity equals the table size, so this never fails.
                let _ = due.push((TimerId(index as u16), callback));
            }
        }
        due
    }
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a stopped timer. `period` is in ticks and must be non-zero.
    pub fn timer_create(
        &mut self,
        period: u32,
        recurring: bool,
        callback: TimerCallback,
    ) -> Result<TimerId, Error> {
        if period == 0 {
            return Err(Error::InvalidArgument);
        }
        let (index, cb) = self
            .timers
            .cbs
            .iter_mut()
            .enumerate()
            .find(|(_, cb)| !cb.allocated)
            .ok_or(Error::CapacityExceeded)?;
        *cb = TimerCb {
            allocated: true,
            period,
            recurring,
            callback: Some(callback),
            enabled: false,
            deadline: 0,
        };
        let id = TimerId(index as u16);
        log::debug!("created {} (period {}, recurring {})", id, period, recurring);
        Ok(id)
    }

    /// Arm `id` to first fire `initial_delay` ticks from now, or one period
    /// from now if `None`. Restarting a running timer re-arms it.
    pub fn timer_start(&mut self, id: TimerId, initial_delay: Option<u32>) -> Result<(), Error> {
        let now = self.now();
        let cb = self.timers.get_mut(id)?;
        let delay = initial_delay.unwrap_or(cb.period);
        cb.deadline = now + delay as Tick;
        cb.enabled = true;
        Ok(())
    }

    /// Disarm `id`. Stopping a stopped timer is a no-op.
    pub fn timer_stop(&mut self, id: TimerId) -> Result<(), Error> {
        self.timers.get_mut(id)?.enabled = false;
        Ok(())
    }

    pub fn timer_is_active(&self, id: TimerId) -> Result<bool, Error> {
        match self.timers.cbs.get(id.index()) {
            Some(cb) if cb.allocated => Ok(cb.enabled),
            _ => Err(Error::NoSuchObject),
        }
    }

    /// Fire every timer due at the current tick.
    pub(crate) fn process_timers(&mut self) {
        let now = self.now();
        for (timer, callback) in self.timers.expire(now) {
            log::trace!("{} fired at {}", timer, now);
            let mut ctx = IsrContext { sched: self, timer };
            callback(&mut ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyMode;
    use crate::policy::Policy;
    use crate::task::{TaskConfig, TaskState, WaitOutcome};
    use crate::time::Timeout;
    use std::cell::RefCell;
    use std::vec::Vec;

    thread_local! {
        static FIRED: RefCell<Vec<(TimerId, Tick)>> = RefCell::new(Vec::new());
    }

    fn record(ctx: &mut IsrContext<'_>) {
        let entry = (ctx.timer(), ctx.now());
        FIRED.with(|f| f.borrow_mut().push(entry));
    }

    fn fired() -> Vec<(TimerId, Tick)> {
        FIRED.with(|f| f.borrow_mut().drain(..).collect())
    }

    fn scheduler() -> Box<Scheduler> {
        fired();
        Box::new(Scheduler::new(Policy::RoundRobin, 1))
    }

    fn run_ticks(s: &mut Scheduler, n: u32) {
        for _ in 0..n {
            s.tick();
        }
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let mut s = scheduler();
        assert_eq!(s.timer_create(0, true, record), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_recurring_fires_every_period() {
        let mut s = scheduler();
        let t = s.timer_create(10, true, record).unwrap();
        run_ticks(&mut s, 3);
        s.timer_start(t, None).unwrap();

        run_ticks(&mut s, 40);
        assert_eq!(fired(), vec![(t, 13), (t, 23), (t, 33), (t, 43)]);
        assert_eq!(s.timer_is_active(t), Ok(true));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut s = scheduler();
        let t = s.timer_create(5, false, record).unwrap();
        s.timer_start(t, None).unwrap();

        run_ticks(&mut s, 30);
        assert_eq!(fired(), vec![(t, 5)]);
        assert_eq!(s.timer_is_active(t), Ok(false));
    }

    #[test]
    fn test_initial_delay_overrides_first_expiry() {
        let mut s = scheduler();
        let t = s.timer_create(10, true, record).unwrap();
        s.timer_start(t, Some(2)).unwrap();

        run_ticks(&mut s, 22);
        assert_eq!(fired(), vec![(t, 2), (t, 12), (t, 22)]);
    }

    #[test]
    fn test_stop_prevents_further_expiry() {
        let mut s = scheduler();
        let t = s.timer_create(4, true, record).unwrap();
        s.timer_start(t, None).unwrap();
        run_ticks(&mut s, 9);
        s.timer_stop(t).unwrap();
        run_ticks(&mut s, 20);

        assert_eq!(fired(), vec![(t, 4), (t, 8)]);
        assert_eq!(s.timer_is_active(t), Ok(false));
    }

    #[test]
    fn test_same_tick_expiry_in_creation_order() {
        let mut s = scheduler();
        let a = s.timer_create(7, false, record).unwrap();
        let b = s.timer_create(3, false, record).unwrap();
        let c = s.timer_create(5, false, record).unwrap();
        s.timer_start(c, Some(5)).unwrap();
        s.timer_start(b, Some(5)).unwrap();
        s.timer_start(a, Some(5)).unwrap();

        run_ticks(&mut s, 5);
        assert_eq!(fired(), vec![(a, 5), (b, 5), (c, 5)]);
    }

    #[test]
    fn test_table_capacity() {
        let mut s = scheduler();
        for _ in 0..MAX_TIMERS {
            s.timer_create(1, true, record).unwrap();
        }
        assert_eq!(s.timer_create(1, true, record), Err(Error::CapacityExceeded));
    }

    thread_local! {
        static CHANNEL: RefCell<Option<ChannelId>> = RefCell::new(None);
    }

    fn wake_consumer(ctx: &mut IsrContext<'_>) {
        if let Some(ch) = CHANNEL.with(|c| *c.borrow()) {
            ctx.signal(ch).unwrap();
        }
    }

    fn noop(_: ()) {}

    #[test]
    fn test_callback_signals_waiting_task() {
        let mut s = scheduler();
        let consumer = s.register(TaskConfig::new("periodic", 4), noop, ()).unwrap();
        s.register(TaskConfig::new("busy", 1), noop, ()).unwrap();
        let ch = s.channel_create(consumer, NotifyMode::Binary).unwrap();
        CHANNEL.with(|c| *c.borrow_mut() = Some(ch));

        let t = s.timer_create(10, true, wake_consumer).unwrap();
        s.timer_start(t, None).unwrap();
        assert_eq!(s.schedule(), Ok(consumer));

        for round in 1..=3 {
            assert_eq!(s.channel_wait(ch, consumer, Timeout::Forever), Ok(WaitOutcome::Blocked));
            s.schedule().unwrap();
            run_ticks(&mut s, 9);
            assert_eq!(s.task_state(consumer), Ok(TaskState::Blocked), "round {}", round);
            s.tick();
            assert_eq!(s.task_state(consumer), Ok(TaskState::Ready));
            assert!(s.take_reschedule());
            assert_eq!(s.schedule(), Ok(consumer));
            assert_eq!(s.complete_wait(consumer), Ok(()));
        }
    }
}
