//! # LotOS: Lottery/Round-Robin Operating System
//!
//! A preemptive RTOS kernel for ARM Cortex-M microcontrollers with two
//! scheduling policies, chosen once per scheduler instance:
//!
//! - **Fixed-priority round-robin**: the highest Ready priority runs;
//!   equal priorities take turns in strict FIFO order, one time slice each.
//!   A task that becomes Ready at a higher priority preempts immediately.
//! - **Lottery**: every task holds tickets; each decision draws one ticket
//!   among the Ready tasks, so CPU share converges to ticket share.
//!
//! Around the scheduler the kernel provides FIFO mutexes, tick-driven
//! software timers, single-consumer notification channels usable from
//! interrupt context, and per-task execution statistics.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init · spawn · start · delay · lock · wait · notify   │
//! ├────────────────────────────────────────────────────────┤
//! │          Scheduler arena (scheduler.rs)                 │
//! │  ┌────────────┬──────────┬──────────┬───────────────┐  │
//! │  │ TCB Store  │ Mutexes  │ Timers   │ Channels      │  │
//! │  │ store.rs   │ mutex.rs │ timer.rs │ notify.rs     │  │
//! │  ├────────────┴──────────┴──────────┴───────────────┤  │
//! │  │ Selector: policy.rs + rng.rs  │ Stats: stats.rs   │  │
//! │  └──────────────────────────────────────────────────┘  │
//! ├────────────────────────────────────────────────────────┤
//! │   Task model (task.rs) · Sync (sync.rs) · Time, Errors  │
//! ├────────────────────────────────────────────────────────┤
//! │        Arch Port (arch/armv7m.rs, arch/hosted.rs)       │
//! │    PendSV · SysTick · First task launch                 │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: every table is a fixed-size array sized in `config.rs`
//! - **Per-task stack**: `[u8; STACK_SIZE]` inline in the TCB, with an
//!   overflow canary at its low end
//! - **One arena**: all kernel state lives in a single [`Scheduler`]; the
//!   global instance is only reachable inside a critical section
//! - **Typed task payloads**: `spawn(config, entry: fn(P), param: P)` moves
//!   `param` onto the new task's stack
//!
//! ## Testing
//!
//! Everything except `arch/armv7m.rs` runs on the host: tests build their
//! own `Scheduler`, call `schedule()`/`tick()` directly and check the
//! resulting states.
//!
//! [`Scheduler`]: scheduler::Scheduler

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod console;
pub mod error;
pub mod kernel;
pub mod mutex;
pub mod notify;
pub mod policy;
pub mod rng;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod sync;
pub mod task;
pub mod time;
pub mod timer;

pub use crate::config::KernelConfig;
pub use crate::error::{Error, Fatal, FatalKind};
pub use crate::policy::Policy;
pub use crate::scheduler::Scheduler;
pub use crate::task::{TaskConfig, TaskId, TaskState};
pub use crate::time::Timeout;
