//! # Task Control Block
//!
//! Defines the task model for LotOS. A task is a function with a typed,
//! owned parameter, a fixed stack region inside its TCB, and the scheduling
//! attributes both policies need: a priority (round-robin) and a ticket
//! count (lottery).
//!
//! TCBs never leave the static table in [`crate::store::TaskStore`]. Other
//! kernel objects refer to tasks by [`TaskId`] only.

use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr;

use crate::config::{CANARY_WORDS, DEFAULT_TIME_SLICE, STACK_CANARY, STACK_SIZE};
use crate::error::Error;
use crate::mutex::MutexId;
use crate::notify::ChannelId;
use crate::time::Tick;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable task identifier: a table slot plus a generation counter.
///
/// The generation is bumped whenever a slot is freed, so an identifier held
/// past its task's deregistration does not name the slot's next occupant.
/// The generation is 16 bits and wraps: an identifier kept across 65 536
/// reuses of the same slot aliases the task then in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    index: u16,
    generation: u16,
}

impl TaskId {
    /// The idle task. Always present in slot 0.
    pub const IDLE: Self = Self::new(0, 0);

    pub(crate) const fn new(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    /// Slot in the task table.
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u16 {
        self.generation
    }

    #[inline]
    pub const fn is_idle(self) -> bool {
        self.index == 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///   ┌──────────┐     select_next()   ┌─────────┐    exit()   ┌────────────┐
///   │  Ready   │ ──────────────────► │ Running │ ──────────► │ Terminated │
///   └──────────┘                     └─────────┘             └────────────┘
///     ▲     ▲      preempt / yield        │
///     │     └─────────────────────────────┤
///     │                                   │ lock / wait / delay
///     │            wake              ┌──────────┐
///     └───────────────────────────── │ Blocked  │
///                                    └──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible to run, waiting for the selector.
    Ready,
    /// Executing on the CPU. Exactly one task is in this state once the
    /// scheduler has started.
    Running,
    /// Waiting on a mutex, a channel, or a delay.
    Blocked,
    /// Finished. The slot is reclaimed by deregistration.
    Terminated,
}

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOn {
    Mutex(MutexId),
    Channel(ChannelId),
    Delay,
}

/// Why a blocked task was made Ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Mutex ownership was handed over on release.
    Granted,
    /// The channel was signalled.
    Signaled,
    /// A delay ran out.
    Elapsed,
    /// A bounded wait expired before the event.
    TimedOut,
}

/// Result of the first phase of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Done without waiting.
    Completed,
    /// The caller is now Blocked; collect the result with
    /// `Scheduler::complete_wait` once it runs again.
    Blocked,
}

// ---------------------------------------------------------------------------
// Task configuration (immutable after creation)
// ---------------------------------------------------------------------------

/// Static configuration for a task, set at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Diagnostic name.
    pub name: &'static str,

    /// Priority, higher = more urgent. Only the round-robin policy looks
    /// at it.
    pub priority: u8,

    /// Ticket count for the lottery policy. Ignored under round-robin.
    pub tickets: u32,

    /// Bytes of the stack slot this task uses. At most `STACK_SIZE`.
    pub stack_size: usize,

    /// Time slice in ticks. `0` selects `DEFAULT_TIME_SLICE`.
    pub time_slice: u32,
}

impl TaskConfig {
    /// One ticket, a full stack slot, the default time slice.
    pub const fn new(name: &'static str, priority: u8) -> Self {
        Self {
            name,
            priority,
            tickets: 1,
            stack_size: STACK_SIZE,
            time_slice: 0,
        }
    }

    pub const fn with_tickets(self, tickets: u32) -> Self {
        Self { tickets, ..self }
    }

    pub const fn with_stack_size(self, stack_size: usize) -> Self {
        Self { stack_size, ..self }
    }

    pub const fn with_time_slice(self, time_slice: u32) -> Self {
        Self { time_slice, ..self }
    }

    /// Returns the effective time slice, falling back to the system default.
    #[inline]
    pub const fn effective_time_slice(&self) -> u32 {
        if self.time_slice > 0 {
            self.time_slice
        } else {
            DEFAULT_TIME_SLICE
        }
    }
}

const IDLE_CONFIG: TaskConfig = TaskConfig::new("idle", 0).with_tickets(0);

// ---------------------------------------------------------------------------
// Stack and initial exception frame
// ---------------------------------------------------------------------------

/// Stack memory of one task slot. 8-byte aligned as required by the AAPCS.
#[repr(C, align(8))]
pub struct Stack(pub [u8; STACK_SIZE]);

/// Words in the initial frame: R4–R11 saved by software, then the
/// hardware-stacked R0–R3, R12, LR, PC, xPSR.
pub const FRAME_WORDS: usize = 16;

pub const FRAME_R0: usize = 8;
pub const FRAME_R1: usize = 9;
pub const FRAME_LR: usize = 13;
pub const FRAME_PC: usize = 14;
pub const FRAME_XPSR: usize = 15;

/// xPSR with only the Thumb bit set.
const INITIAL_XPSR: usize = 0x0100_0000;

const CANARY_BYTES: usize = CANARY_WORDS * 4;

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB): the central data structure for each task.
///
/// ## Memory Layout
///
/// Each TCB includes an inline stack slot. The task uses the top
/// `config.stack_size` bytes of it; the lowest `CANARY_WORDS` words of that
/// region hold the overflow canary. `stack_pointer` is the saved PSP and is
/// updated on every context switch.
pub struct TaskControlBlock {
    /// Identifier of the task occupying this slot. For a free slot, the
    /// generation the next occupant will receive.
    pub id: TaskId,

    /// Current execution state.
    pub state: TaskState,

    /// Static configuration.
    pub config: TaskConfig,

    /// Saved stack pointer (PSP). Points into `self.stack`.
    pub stack_pointer: usize,

    /// Per-task stack memory.
    pub stack: Stack,

    /// Remaining ticks in the current time slice.
    pub ticks_remaining: u32,

    /// Dispatch sequence number of the last time this task was selected.
    /// `0` means never. Orders equal-priority peers under round-robin.
    pub last_run: u64,

    /// What the task is blocked on, if anything.
    pub wait: Option<WaitOn>,

    /// Tick at which a bounded wait expires.
    pub wake_at: Option<Tick>,

    /// Set when the task is woken; consumed by `complete_wait`.
    pub wake_reason: Option<WakeReason>,

    /// Whether this slot is allocated.
    pub active: bool,
}

impl TaskControlBlock {
    /// An unallocated slot. Used to initialize the static array.
    pub const EMPTY: Self = Self {
        id: TaskId::new(0, 0),
        state: TaskState::Terminated,
        config: TaskConfig::new("", 0),
        stack_pointer: 0,
        stack: Stack([0u8; STACK_SIZE]),
        ticks_remaining: 0,
        last_run: 0,
        wait: None,
        wake_at: None,
        wake_reason: None,
        active: false,
    };

    /// The idle task's slot: always allocated, always Ready, priority 0,
    /// no tickets.
    pub const IDLE: Self = Self {
        id: TaskId::IDLE,
        state: TaskState::Ready,
        config: IDLE_CONFIG,
        ticks_remaining: DEFAULT_TIME_SLICE,
        active: true,
        ..Self::EMPTY
    };

    /// Initialize a slot for a new task. The task starts Ready.
    ///
    /// The stack frame is set up separately by [`Self::launch`].
    pub fn init(&mut self, id: TaskId, config: TaskConfig) {
        self.id = id;
        self.state = TaskState::Ready;
        self.config = config;
        self.stack_pointer = 0;
        self.ticks_remaining = config.effective_time_slice();
        self.last_run = 0;
        self.wait = None;
        self.wake_at = None;
        self.wake_reason = None;
        self.active = true;
    }

    /// Check if this task can be handed to the selector.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.active && self.state == TaskState::Ready
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Offset of the lowest byte of this task's stack region in `self.stack`.
    fn region_offset(&self) -> usize {
        let size = self.config.stack_size.min(STACK_SIZE);
        (STACK_SIZE - size + 7) & !0x07
    }

    /// Write the canary pattern at the low end of the stack region.
    pub fn paint_canary(&mut self) {
        let start = self.region_offset();
        for word in self.stack.0[start..start + CANARY_BYTES].chunks_exact_mut(4) {
            word.copy_from_slice(&STACK_CANARY.to_ne_bytes());
        }
    }

    /// `false` once anything has written over the canary.
    pub fn stack_intact(&self) -> bool {
        let start = self.region_offset();
        self.stack.0[start..start + CANARY_BYTES]
            .chunks_exact(4)
            .all(|word| word == STACK_CANARY.to_ne_bytes())
    }

    /// Place `param` at the top of the stack and build the initial exception
    /// frame below it, so that the first switch into this task enters
    /// `entry(param)`.
    ///
    /// ## Stack Layout (top = high address, growing down)
    ///
    /// ```text
    /// [payload: P]               <- R0 of the first frame points here
    /// [Hardware stacked frame]
    ///   xPSR  (Thumb bit set)
    ///   PC    (launch trampoline for P, bit 0 clear)
    ///   LR    (task_exit)
    ///   R12, R3, R2   (0)
    ///   R1    (entry)
    ///   R0    (&payload)
    /// [Software saved context]
    ///   R11 … R4 (0)             <- stack_pointer after launch
    /// [...free...]
    /// [canary]                   <- low end of the stack region
    /// ```
    ///
    /// Fails with `InvalidArgument` if the frame and payload don't fit above
    /// the canary. Nothing is written in that case.
    pub fn launch<P: Send + 'static>(&mut self, entry: fn(P), param: P) -> Result<(), Error> {
        let word = size_of::<usize>();
        let floor = self.region_offset() + CANARY_BYTES;
        let base = self.stack.0.as_mut_ptr();
        let base_addr = base as usize;

        let top = (base_addr + STACK_SIZE) & !0x07;
        let payload_align = align_of::<P>().max(8);
        let payload_at = top
            .checked_sub(size_of::<P>())
            .map(|addr| addr & !(payload_align - 1))
            .ok_or(Error::InvalidArgument)?;
        let frame_at = payload_at
            .checked_sub(FRAME_WORDS * word)
            .map(|addr| addr & !0x07)
            .ok_or(Error::InvalidArgument)?;
        if frame_at < base_addr + floor {
            return Err(Error::InvalidArgument);
        }

        // Safety: both offsets were checked to lie inside `self.stack`,
        // above the canary, and are suitably aligned for their types.
        unsafe {
            let payload = base.add(payload_at - base_addr) as *mut P;
            ptr::write(payload, param);

            let frame = base.add(frame_at - base_addr) as *mut usize;
            for i in 0..FRAME_WORDS {
                frame.add(i).write(0);
            }
            frame.add(FRAME_R0).write(payload as usize);
            frame.add(FRAME_R1).write(entry as usize);
            frame.add(FRAME_LR).write(task_exit as usize);
            // The stacked PC carries no Thumb bit; xPSR.T holds it.
            frame.add(FRAME_PC).write(trampoline::<P> as usize & !1);
            frame.add(FRAME_XPSR).write(INITIAL_XPSR);
        }

        self.paint_canary();
        self.stack_pointer = frame_at;
        Ok(())
    }

    /// Enter the Blocked state.
    pub fn block(&mut self, wait: WaitOn, wake_at: Option<Tick>) {
        self.state = TaskState::Blocked;
        self.wait = Some(wait);
        self.wake_at = wake_at;
        self.wake_reason = None;
    }

    /// Leave the Blocked state.
    pub fn wake(&mut self, reason: WakeReason) {
        self.state = TaskState::Ready;
        self.wait = None;
        self.wake_at = None;
        self.wake_reason = Some(reason);
    }
}

/// First code a task runs. Takes ownership of the payload that `launch`
/// left on the stack and calls the entry function with it.
extern "C" fn trampoline<P: Send + 'static>(payload: *mut P, entry: usize) -> ! {
    // Safety: `launch` moved a `P` to `payload` and stored `entry` from a
    // `fn(P)`. Each task runs its trampoline exactly once.
    let (param, entry) = unsafe {
        (
            ptr::read(payload),
            core::mem::transmute::<usize, fn(P)>(entry),
        )
    };
    entry(param);
    crate::kernel::exit()
}

/// Return address of the initial frame.
extern "C" fn task_exit() -> ! {
    crate::kernel::exit()
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
