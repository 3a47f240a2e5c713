//! # Kernel
//!
//! Top-level kernel initialization and the task-facing API for LotOS.
//!
//! The kernel owns the one global [`Scheduler`] and wraps every operation on
//! it in a critical section. Calls that may block return only after the
//! caller has been switched out and back in: the scheduler marks the task
//! Blocked, the kernel pends a context switch, and once the task runs again
//! it collects its wake-up result.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init(config)   ← policy, seed, hooks
//!         ├─► kernel::spawn(..)      ← register tasks (×N)
//!         ├─► kernel::mutex_create() / timer_create() / channel_create()
//!         └─► kernel::start()        ← never returns
//!               ├─► give the idle task its frame
//!               ├─► run the startup hook
//!               ├─► select the first task
//!               └─► arch::port::launch()
//!                     ├─► SysTick + PendSV priorities
//!                     └─► enter the first task on PSP
//! ```

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;

use critical_section::Mutex;

use crate::arch::port;
use crate::config::{default_fatal_hook, KernelConfig, DEFAULT_SEED};
use crate::error::{Error, Fatal, FatalHook, FatalKind};
use crate::mutex::MutexId;
use crate::notify::{ChannelId, NotifyMode};
use crate::policy::Policy;
use crate::scheduler::Scheduler;
use crate::stats::Snapshot;
use crate::sync::CriticalSection;
use crate::task::{TaskConfig, TaskId, WaitOutcome};
use crate::time::{Tick, Timeout};
use crate::timer::{TimerCallback, TimerId};

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// Global scheduler instance. Only reachable inside a critical section.
static SCHEDULER: Mutex<RefCell<Scheduler>> =
    Mutex::new(RefCell::new(Scheduler::new(Policy::RoundRobin, DEFAULT_SEED)));

#[derive(Clone, Copy)]
struct Hooks {
    fatal: FatalHook,
    startup: Option<fn()>,
}

static HOOKS: Mutex<Cell<Hooks>> = Mutex::new(Cell::new(Hooks {
    fatal: default_fatal_hook,
    startup: None,
}));

/// Run `f` on the scheduler inside a critical section.
///
/// Fails with `BadContext` when the scheduler is already in use further up
/// the call stack, which is the case inside timer callbacks.
fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Result<R, Error> {
    let cs = CriticalSection::enter();
    let cell = SCHEDULER.borrow(cs.token());
    let Ok(mut sched) = cell.try_borrow_mut() else {
        log::warn!("kernel re-entered while the scheduler is busy");
        return Err(Error::BadContext);
    };
    Ok(f(&mut sched))
}

/// Like [`with_scheduler`], then pend a context switch if the call made one
/// necessary. The switch happens as soon as the section is left.
fn access<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Result<R, Error> {
    let (result, switch) = with_scheduler(|s| {
        let result = f(s);
        (result, s.needs_reschedule())
    })?;
    if switch {
        port::request_context_switch();
    }
    Ok(result)
}

/// Second half of a blocking call. By the time a `Blocked` caller gets
/// here it has been switched out and woken again.
fn finish(outcome: WaitOutcome) -> Result<(), Error> {
    match outcome {
        WaitOutcome::Completed => Ok(()),
        WaitOutcome::Blocked => with_scheduler(|s| s.complete_wait(s.current()))?,
    }
}

fn hooks() -> Hooks {
    critical_section::with(|cs| HOOKS.borrow(cs).get())
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Initialize the kernel with a fresh scheduler.
///
/// Must be called before any other kernel function, from `main`, before
/// `start`. Calling it again discards every registered task and object.
pub fn init(config: KernelConfig) {
    critical_section::with(|cs| {
        SCHEDULER.replace(cs, Scheduler::new(config.policy, config.seed));
        HOOKS.borrow(cs).set(Hooks {
            fatal: config.fatal_hook,
            startup: config.startup_hook,
        });
    });
    log::debug!("kernel initialized ({:?})", config.policy);
}

/// Register a task that runs `entry(param)`.
///
/// Callable before `start` and from running tasks. A new task that
/// outranks the caller runs immediately.
///
/// # Example
/// ```ignore
/// let config = TaskConfig::new("printer", 6).with_tickets(94);
/// kernel::spawn(config, printer, Printer { text: "Task 1\r\n", uart })?;
/// ```
pub fn spawn<P: Send + 'static>(config: TaskConfig, entry: fn(P), param: P) -> Result<TaskId, Error> {
    access(|s| s.register(config, entry, param))?
}

/// Free a Terminated task's slot.
pub fn deregister(task: TaskId) -> Result<(), Error> {
    with_scheduler(|s| s.deregister(task))?
}

/// Change a task's ticket count (lottery policy).
pub fn set_tickets(task: TaskId, tickets: u32) -> Result<(), Error> {
    access(|s| s.set_tickets(task, tickets))?
}

/// Start the scheduler. **Does not return.**
///
/// Runs the startup hook, selects the first task and hands the CPU to it.
/// From here on the system is preemptive.
pub fn start() -> ! {
    let launched = with_scheduler(|s| s.launch_idle(port::idle_entry)).and_then(|r| r);
    if launched.is_err() {
        fatal(Fatal::new(FatalKind::InvariantViolation, Some(TaskId::IDLE), "idle"));
    }

    if let Some(hook) = hooks().startup {
        hook();
    }

    let first = with_scheduler(|s| {
        let first = s.schedule()?;
        log::debug!("starting with task {}", first);
        s.stack_pointer(first)
            .map_err(|_| Fatal::new(FatalKind::InvariantViolation, Some(first), ""))
    })
    .unwrap_or_else(|_| Err(Fatal::new(FatalKind::InvariantViolation, None, "")));
    match first {
        Ok(sp) => port::launch(sp),
        Err(f) => fatal(f),
    }
}

// ---------------------------------------------------------------------------
// Current task
// ---------------------------------------------------------------------------

/// Voluntarily give up the CPU. Equal-priority peers run first.
pub fn yield_now() -> Result<(), Error> {
    access(|s| s.yield_current())
}

/// Block the calling task for `ticks` ticks. `delay(0)` is a yield.
pub fn delay(ticks: u32) -> Result<(), Error> {
    let outcome = access(|s| s.delay_current(ticks))??;
    finish(outcome)
}

/// Terminate the calling task. Also where a task's entry function returns
/// to.
pub fn exit() -> ! {
    if let Err(e) = access(|s| s.exit_current()).and_then(|r| r) {
        log::error!("task exit failed: {}", e);
    }
    loop {
        port::wait_for_interrupt();
    }
}

pub fn current() -> Result<TaskId, Error> {
    with_scheduler(|s| s.current())
}

/// Ticks since `start`.
pub fn now() -> Result<Tick, Error> {
    with_scheduler(|s| s.now())
}

// ---------------------------------------------------------------------------
// Mutexes
// ---------------------------------------------------------------------------

pub fn mutex_create() -> Result<MutexId, Error> {
    with_scheduler(|s| s.mutex_create())?
}

/// Acquire `mutex` for the calling task, blocking up to `timeout`.
///
/// The returned guard releases the mutex when dropped.
pub fn lock(mutex: MutexId, timeout: Timeout) -> Result<MutexGuard, Error> {
    let outcome = access(|s| s.mutex_acquire(mutex, s.current(), timeout))??;
    finish(outcome)?;
    Ok(MutexGuard {
        mutex,
        _not_send: PhantomData,
    })
}

/// Release `mutex`. Ownership passes to the oldest waiter, if any.
pub fn unlock(mutex: MutexId) -> Result<(), Error> {
    access(|s| s.mutex_release(mutex, s.current()))?
}

/// Ownership of a mutex for the current task. Unlocks on drop.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct MutexGuard {
    mutex: MutexId,
    _not_send: PhantomData<*mut ()>,
}

impl MutexGuard {
    pub fn mutex(&self) -> MutexId {
        self.mutex
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if let Err(e) = unlock(self.mutex) {
            log::error!("unlock of {} failed: {}", self.mutex, e);
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Create a stopped timer with a period in ticks.
pub fn timer_create(period: u32, recurring: bool, callback: TimerCallback) -> Result<TimerId, Error> {
    with_scheduler(|s| s.timer_create(period, recurring, callback))?
}

/// Arm a timer. `None` fires first after one period.
pub fn timer_start(timer: TimerId, initial_delay: Option<u32>) -> Result<(), Error> {
    with_scheduler(|s| s.timer_start(timer, initial_delay))?
}

pub fn timer_stop(timer: TimerId) -> Result<(), Error> {
    with_scheduler(|s| s.timer_stop(timer))?
}

// ---------------------------------------------------------------------------
// Notification channels
// ---------------------------------------------------------------------------

pub fn channel_create(consumer: TaskId, mode: NotifyMode) -> Result<ChannelId, Error> {
    with_scheduler(|s| s.channel_create(consumer, mode))?
}

/// Signal a channel. Never blocks; safe from tasks and interrupt handlers.
///
/// Timer callbacks already run inside the scheduler and must use
/// [`IsrContext::signal`](crate::timer::IsrContext::signal); from there this
/// call fails with `BadContext`.
pub fn notify(channel: ChannelId) -> Result<(), Error> {
    access(|s| s.channel_signal(channel))?
}

/// Wait for a signal on a channel the calling task consumes.
pub fn wait(channel: ChannelId, timeout: Timeout) -> Result<(), Error> {
    let outcome = access(|s| s.channel_wait(channel, s.current(), timeout))??;
    finish(outcome)
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Consistent copy of the execution counters.
pub fn stats() -> Result<Snapshot, Error> {
    with_scheduler(|s| s.stats())
}

// ---------------------------------------------------------------------------
// Port entry points
// ---------------------------------------------------------------------------

/// SysTick: advance time, fire timers, account the time slice.
pub(crate) fn on_tick() {
    if let Err(e) = access(|s| s.tick()) {
        log::error!("tick dropped: {}", e);
    }
}

/// PendSV: store the outgoing stack pointer, pick the next task, return
/// its stack pointer.
pub(crate) fn switch_context(sp: usize) -> usize {
    let next = with_scheduler(|s| {
        s.save_stack_pointer(sp);
        let next = s.schedule()?;
        s.stack_pointer(next)
            .map_err(|_| Fatal::new(FatalKind::InvariantViolation, Some(next), ""))
    })
    .unwrap_or_else(|_| Err(Fatal::new(FatalKind::InvariantViolation, None, "")));
    match next {
        Ok(sp) => sp,
        Err(f) => fatal(f),
    }
}

/// Hand an unrecoverable condition to the fatal hook.
pub fn fatal(f: Fatal) -> ! {
    let hook = hooks().fatal;
    hook(&f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::IsrContext;
    use std::panic;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Mutex as TestLock, MutexGuard as TestGuard, PoisonError};

    /// The global instance is shared by every test in this binary.
    static GLOBAL: TestLock<()> = TestLock::new(());

    fn exclusive() -> TestGuard<'static, ()> {
        GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker(_: u32) {}

    #[test]
    fn test_global_setup_before_start() {
        let _g = exclusive();
        init(KernelConfig::new(Policy::Lottery).with_seed(11));
        let a = spawn(TaskConfig::new("a", 1).with_tickets(3), worker, 1).unwrap();
        assert_eq!(
            spawn(TaskConfig::new("b", 1).with_tickets(0), worker, 2),
            Err(Error::InvalidTicketCount)
        );
        let m = mutex_create().unwrap();
        let ch = channel_create(a, NotifyMode::Binary).unwrap();
        notify(ch).unwrap();

        with_scheduler(|s| {
            assert_eq!(s.policy(), Policy::Lottery);
            assert_eq!(s.mutex_owner(m), Ok(None));
            assert_eq!(s.channel_pending(ch), Ok(1));
            assert!(!s.is_started());
        })
        .unwrap();
        assert_eq!(current(), Ok(TaskId::IDLE));
        assert_eq!(now(), Ok(0));
        assert_eq!(stats().unwrap().total, 0);
    }

    static ALARM: Mutex<Cell<Option<ChannelId>>> = Mutex::new(Cell::new(None));
    static FROM_CALLBACK: Mutex<Cell<Option<(Result<(), Error>, Result<Tick, Error>)>>> =
        Mutex::new(Cell::new(None));

    fn notify_through_kernel(ctx: &mut IsrContext<'_>) {
        let Some(ch) = critical_section::with(|cs| ALARM.borrow(cs).get()) else {
            return;
        };
        let outcome = (notify(ch), now());
        critical_section::with(|cs| FROM_CALLBACK.borrow(cs).set(Some(outcome)));
        ctx.signal(ch).unwrap();
    }

    #[test]
    fn test_kernel_calls_from_timer_callback_are_rejected() {
        let _g = exclusive();
        init(KernelConfig::new(Policy::RoundRobin));
        let a = spawn(TaskConfig::new("a", 1), worker, 1).unwrap();
        let ch = channel_create(a, NotifyMode::Binary).unwrap();
        critical_section::with(|cs| ALARM.borrow(cs).set(Some(ch)));
        let t = timer_create(1, false, notify_through_kernel).unwrap();
        timer_start(t, None).unwrap();

        on_tick();

        let outcome = critical_section::with(|cs| FROM_CALLBACK.borrow(cs).take());
        assert_eq!(outcome, Some((Err(Error::BadContext), Err(Error::BadContext))));
        // The kernel stays usable and the signal went through `IsrContext`.
        assert_eq!(now(), Ok(1));
        with_scheduler(|s| assert_eq!(s.channel_pending(ch), Ok(1))).unwrap();
    }

    static STARTUP_RUNS: AtomicU32 = AtomicU32::new(0);
    static STARTED_BEFORE_HOOK: AtomicBool = AtomicBool::new(true);

    fn count_startup() {
        STARTUP_RUNS.fetch_add(1, Ordering::SeqCst);
        let started = with_scheduler(|s| s.is_started()).unwrap();
        STARTED_BEFORE_HOOK.store(started, Ordering::SeqCst);
    }

    #[test]
    fn test_start_runs_startup_hook_once_before_dispatch() {
        let _g = exclusive();
        STARTUP_RUNS.store(0, Ordering::SeqCst);
        init(KernelConfig::new(Policy::RoundRobin).with_startup_hook(count_startup));
        let a = spawn(TaskConfig::new("first", 3), worker, 1).unwrap();

        // The hosted port cannot enter a task and panics at launch.
        assert!(panic::catch_unwind(|| -> () { start() }).is_err());

        assert_eq!(STARTUP_RUNS.load(Ordering::SeqCst), 1);
        assert!(!STARTED_BEFORE_HOOK.load(Ordering::SeqCst));
        assert_eq!(current(), Ok(a));
        assert_eq!(stats().unwrap().count(a), 1);
    }

    static LAST_FATAL: Mutex<Cell<Option<Fatal>>> = Mutex::new(Cell::new(None));

    fn record_fatal(fatal: &Fatal) -> ! {
        critical_section::with(|cs| LAST_FATAL.borrow(cs).set(Some(*fatal)));
        panic!("halted: {}", fatal);
    }

    #[test]
    fn test_stack_overflow_reaches_fatal_hook() {
        let _g = exclusive();
        critical_section::with(|cs| LAST_FATAL.borrow(cs).set(None));
        init(KernelConfig::new(Policy::RoundRobin).with_fatal_hook(record_fatal));
        let a = spawn(TaskConfig::new("deep", 3), worker, 1).unwrap();
        spawn(TaskConfig::new("other", 3), worker, 2).unwrap();
        assert!(panic::catch_unwind(|| -> () { start() }).is_err());
        assert_eq!(current(), Ok(a));

        let sp = with_scheduler(|s| {
            // Full-size stack region: the canary starts at byte 0.
            s.tasks.get_mut(a).unwrap().stack.0[0] = 0;
            s.yield_current();
            s.stack_pointer(a).unwrap()
        })
        .unwrap();

        assert!(panic::catch_unwind(|| switch_context(sp)).is_err());
        let fatal = critical_section::with(|cs| LAST_FATAL.borrow(cs).get()).unwrap();
        assert_eq!(fatal.kind, FatalKind::StackOverflow);
        assert_eq!(fatal.task, Some(a));
        assert_eq!(fatal.name, "deep");
    }
}
