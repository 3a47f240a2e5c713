//! Tick-based time.

/// Monotonic tick count since the scheduler started.
pub type Tick = u64;

/// Bound on a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until the event happens.
    Forever,
    /// Wait at most this many ticks. `Ticks(0)` never blocks.
    Ticks(u32),
}

impl Timeout {
    /// Poll without blocking.
    pub const NONE: Self = Timeout::Ticks(0);

    /// `true` if the call must fail instead of blocking.
    #[inline]
    pub const fn is_zero(self) -> bool {
        matches!(self, Timeout::Ticks(0))
    }

    /// Absolute wake-up deadline for a wait that starts at `now`.
    #[inline]
    pub const fn deadline(self, now: Tick) -> Option<Tick> {
        match self {
            Timeout::Forever => None,
            Timeout::Ticks(n) => Some(now + n as Tick),
        }
    }
}
