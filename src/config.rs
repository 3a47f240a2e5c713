//! # LotOS Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! All limits are fixed at compile time; nothing is allocated dynamically. The few
//! choices that are made at startup (scheduling policy, random seed, hooks)
//! live in [`KernelConfig`] and are handed to `kernel::init()` once.

use crate::error::{Fatal, FatalHook};
use crate::policy::Policy;

/// Maximum number of tasks the system can manage simultaneously,
/// including the idle task in slot 0. This bounds the static TCB array.
/// Each task consumes `STACK_SIZE` bytes of RAM.
pub const MAX_TASKS: usize = 8;

/// Number of mutex control blocks.
pub const MAX_MUTEXES: usize = 4;

/// Number of software timers.
pub const MAX_TIMERS: usize = 4;

/// Number of notification channels.
pub const MAX_CHANNELS: usize = 4;

/// SysTick frequency in Hz. One tick is the unit of every delay, timeout,
/// timer period and time slice.
pub const TICK_HZ: u32 = 1000;

/// Default time slice in ticks. A task runs for this many ticks before an
/// equal-priority peer (round-robin) or a fresh draw (lottery) gets a turn.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Per-task stack size in bytes. A task may ask for less, never more.
pub const STACK_SIZE: usize = 1024;

/// Number of 32-bit canary words painted at the low end of every stack.
pub const CANARY_WORDS: usize = 4;

/// Canary pattern. A stack whose canary no longer reads back as this value
/// has overflowed.
pub const STACK_CANARY: u32 = 0xA5A5_A5A5;

/// Upper bound for the sum of all live ticket counts under the lottery
/// policy. Keeps every draw inside a `u32`.
pub const MAX_TOTAL_TICKETS: u32 = 1_000_000;

/// Seed used when `KernelConfig` does not provide one.
pub const DEFAULT_SEED: u32 = 0x2545_F491;

/// System clock frequency in Hz (MPS2 AN385 runs its core at 25 MHz).
pub const SYSTEM_CLOCK_HZ: u32 = 25_000_000;

/// Convert milliseconds to scheduler ticks, rounding down.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ((ms as u64 * TICK_HZ as u64) / 1000) as u32
}

/// Startup-time kernel configuration.
///
/// The policy is fixed for the lifetime of a scheduler instance; there is
/// no way to switch it once tasks are running.
#[derive(Clone, Copy)]
pub struct KernelConfig {
    /// Scheduling policy for this instance.
    pub policy: Policy,
    /// Seed for the lottery draw. `0` selects [`DEFAULT_SEED`].
    pub seed: u32,
    /// Called on stack overflow, capacity exhaustion flagged as fatal, or a
    /// broken kernel invariant. Never returns.
    pub fatal_hook: FatalHook,
    /// Runs exactly once, right before the first task is dispatched.
    pub startup_hook: Option<fn()>,
}

impl KernelConfig {
    pub const fn new(policy: Policy) -> Self {
        Self {
            policy,
            seed: DEFAULT_SEED,
            fatal_hook: default_fatal_hook,
            startup_hook: None,
        }
    }

    pub const fn with_seed(self, seed: u32) -> Self {
        Self { seed, ..self }
    }

    pub const fn with_fatal_hook(self, fatal_hook: FatalHook) -> Self {
        Self { fatal_hook, ..self }
    }

    pub const fn with_startup_hook(self, hook: fn()) -> Self {
        Self {
            startup_hook: Some(hook),
            ..self
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new(Policy::RoundRobin)
    }
}

/// Log the condition and park the CPU.
pub fn default_fatal_hook(fatal: &Fatal) -> ! {
    log::error!("{}", fatal);
    crate::arch::port::halt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_ticks() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1000), TICK_HZ);
        assert_eq!(ms_to_ticks(10_000), 10 * TICK_HZ);
    }

    #[test]
    fn test_kernel_config_builder() {
        let config = KernelConfig::new(Policy::Lottery).with_seed(7);
        assert_eq!(config.policy, Policy::Lottery);
        assert_eq!(config.seed, 7);
        assert!(config.startup_hook.is_none());
        assert_eq!(KernelConfig::default().policy, Policy::RoundRobin);
    }
}
