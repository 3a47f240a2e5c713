//! End-to-end scheduling scenarios on a host-side `Scheduler`.
//!
//! Task bodies cannot run on the host, so each scenario steps the tasks by
//! hand: whatever `current()` reports is the task that executes its next
//! step, and `tick()`/`schedule()` stand in for SysTick and PendSV.

use std::cell::Cell;

use critical_section::Mutex;
use quickcheck_macros::quickcheck;

use lotos::mutex::MutexId;
use lotos::notify::{ChannelId, NotifyMode};
use lotos::task::WaitOutcome;
use lotos::timer::IsrContext;
use lotos::{Policy, Scheduler, TaskConfig, TaskId, TaskState, Timeout};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn body(_: usize) {}

fn scheduler(policy: Policy, seed: u32) -> Box<Scheduler> {
    Box::new(Scheduler::new(policy, seed))
}

#[test]
fn lottery_shares_follow_tickets() {
    init_logger();
    let mut s = scheduler(Policy::Lottery, 0x2545_f491);
    let ids: Vec<TaskId> = [94, 5, 1]
        .iter()
        .enumerate()
        .map(|(n, &tickets)| {
            let config = TaskConfig::new("worker", 6).with_tickets(tickets);
            s.register(config, body, n).unwrap()
        })
        .collect();

    let mut latency = 0;
    for round in 0..10_000u32 {
        if round > 0 {
            s.yield_current();
            // Every tenth switch is delayed by one tick.
            if round % 10 == 0 {
                s.tick();
            }
        }
        s.schedule().unwrap();
        let snap = s.stats();
        assert!(snap.cumulative_latency >= latency);
        latency = snap.cumulative_latency;
    }

    let snap = s.stats();
    assert_eq!(snap.total, 10_000);
    assert_eq!(snap.count(TaskId::IDLE), 0);
    let near = |id: TaskId, expected: i64, tolerance: i64| {
        let got = snap.count(id) as i64;
        assert!(
            (got - expected).abs() <= tolerance,
            "task {} ran {} times, expected about {}",
            id,
            got,
            expected
        );
    };
    near(ids[0], 9400, 200);
    near(ids[1], 500, 130);
    near(ids[2], 100, 60);
    assert_eq!(snap.cumulative_latency, 999);
}

#[test]
fn round_robin_rotates_equal_priorities() {
    init_logger();
    let mut s = scheduler(Policy::RoundRobin, 1);
    let ids: Vec<TaskId> = (0..3)
        .map(|n| {
            let config = TaskConfig::new("peer", 4).with_time_slice(2);
            s.register(config, body, n).unwrap()
        })
        .collect();
    s.register(TaskConfig::new("background", 1), body, 9)
        .unwrap();

    let mut order = vec![s.schedule().unwrap()];
    for _ in 0..17 {
        s.tick();
        if s.take_reschedule() {
            order.push(s.schedule().unwrap());
        }
    }
    let expected: Vec<TaskId> = ids.iter().cycle().take(9).copied().collect();
    assert_eq!(order, expected);
}

/// Where a task is in `lock; read; write; unlock`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Acquire,
    AwaitGrant,
    Read,
    Write(u32),
    Release,
    Done,
}

const WORKERS: usize = 4;
const ROUNDS: u32 = 25;

/// Runs four equal-priority tasks incrementing a shared counter under one
/// mutex. `preempt` decides, step by step, whether a tick with a one-tick
/// slice lands between two steps.
fn run_counter(preempt: &[bool]) -> Result<u32, String> {
    let mut s = scheduler(Policy::RoundRobin, 3);
    let m: MutexId = s.mutex_create().map_err(|e| e.to_string())?;
    let mut ids = Vec::new();
    for n in 0..WORKERS {
        let config = TaskConfig::new("counter", 3).with_time_slice(1);
        ids.push(s.register(config, body, n).map_err(|e| e.to_string())?);
    }
    let mut steps = [Step::Acquire; WORKERS];
    let mut rounds = [0u32; WORKERS];
    let mut counter = 0u32;

    s.schedule().map_err(|f| f.to_string())?;
    let mut flags = preempt.iter().copied().chain(std::iter::repeat(false));
    for _ in 0..100_000 {
        let cur = s.current();
        if cur.is_idle() {
            break;
        }
        let slot = ids
            .iter()
            .position(|&id| id == cur)
            .ok_or("unknown task running")?;

        match steps[slot] {
            Step::Acquire => match s.mutex_acquire(m, cur, Timeout::Forever) {
                Ok(WaitOutcome::Completed) => steps[slot] = Step::Read,
                Ok(WaitOutcome::Blocked) => steps[slot] = Step::AwaitGrant,
                Err(e) => return Err(format!("acquire failed: {}", e)),
            },
            Step::AwaitGrant => {
                s.complete_wait(cur).map_err(|e| e.to_string())?;
                steps[slot] = Step::Read;
            }
            Step::Read => {
                if s.mutex_owner(m) != Ok(Some(cur)) {
                    return Err(format!("task {} in critical section without the lock", cur));
                }
                steps[slot] = Step::Write(counter);
            }
            Step::Write(seen) => {
                counter = seen + 1;
                steps[slot] = Step::Release;
            }
            Step::Release => {
                s.mutex_release(m, cur).map_err(|e| e.to_string())?;
                rounds[slot] += 1;
                if rounds[slot] == ROUNDS {
                    s.exit_current().map_err(|e| e.to_string())?;
                    steps[slot] = Step::Done;
                } else {
                    steps[slot] = Step::Acquire;
                }
            }
            Step::Done => return Err(format!("terminated task {} was dispatched", cur)),
        }

        if flags.next() == Some(true) {
            s.tick();
        }
        if s.take_reschedule() {
            s.schedule().map_err(|f| f.to_string())?;
        }
    }

    if steps.iter().any(|&step| step != Step::Done) {
        return Err(format!("unfinished tasks: {:?}", steps));
    }
    Ok(counter)
}

#[test]
fn counter_without_preemption() {
    init_logger();
    assert_eq!(run_counter(&[]), Ok(WORKERS as u32 * ROUNDS));
}

#[test]
fn counter_preempted_every_step() {
    init_logger();
    assert_eq!(run_counter(&[true; 4096]), Ok(WORKERS as u32 * ROUNDS));
}

#[quickcheck]
fn prop_no_lost_updates(preempt: Vec<bool>) -> bool {
    run_counter(&preempt) == Ok(WORKERS as u32 * ROUNDS)
}

static ALARM: Mutex<Cell<Option<ChannelId>>> = Mutex::new(Cell::new(None));

fn alarm_tick(ctx: &mut IsrContext<'_>) {
    if let Some(alarm) = critical_section::with(|cs| ALARM.borrow(cs).get()) {
        ctx.signal(alarm).unwrap();
    }
}

#[test]
fn timer_alarm_preempts_low_priority_work() {
    init_logger();
    let mut s = scheduler(Policy::RoundRobin, 5);
    let t1 = s.register(TaskConfig::new("task1", 6), body, 1).unwrap();
    let t2 = s.register(TaskConfig::new("task2", 1), body, 2).unwrap();
    let t3 = s.register(TaskConfig::new("task3", 6), body, 3).unwrap();
    let t4 = s.register(TaskConfig::new("task4", 7), body, 4).unwrap();
    let alarm = s.channel_create(t4, NotifyMode::Binary).unwrap();
    critical_section::with(|cs| ALARM.borrow(cs).set(Some(alarm)));
    let timer = s.timer_create(10, true, alarm_tick).unwrap();
    s.timer_start(timer, None).unwrap();

    assert_eq!(s.schedule(), Ok(t4));
    assert_eq!(s.channel_wait(alarm, t4, Timeout::Forever), Ok(WaitOutcome::Blocked));
    assert_eq!(s.schedule(), Ok(t1));
    assert_eq!(s.delay_current(100), Ok(WaitOutcome::Blocked));
    assert_eq!(s.schedule(), Ok(t3));
    assert_eq!(s.delay_current(100), Ok(WaitOutcome::Blocked));
    assert_eq!(s.schedule(), Ok(t2));

    for _ in 0..9 {
        s.tick();
        if s.take_reschedule() {
            assert_eq!(s.schedule(), Ok(t2));
        }
    }
    s.tick();
    assert!(s.take_reschedule());
    assert_eq!(s.schedule(), Ok(t4));
    assert_eq!(s.complete_wait(t4), Ok(()));
    assert_eq!(s.task_state(t2), Ok(TaskState::Ready));

    // Back to sleep; the next alarm lands ten ticks later.
    assert_eq!(s.channel_wait(alarm, t4, Timeout::Forever), Ok(WaitOutcome::Blocked));
    assert_eq!(s.schedule(), Ok(t2));
    for _ in 0..9 {
        s.tick();
    }
    assert_eq!(s.task_state(t4), Ok(TaskState::Blocked));
    s.tick();
    assert_eq!(s.task_state(t4), Ok(TaskState::Ready));
    assert_eq!(s.now(), 20);
}
