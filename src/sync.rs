//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections for the kernel's shared state.
//! Everything the scheduler owns is mutated only while a [`CriticalSection`]
//! guard is alive, so the tick interrupt never observes a half-updated
//! Ready set.
//!
//! The guard releases in `Drop`, so early returns and `?` leave the section
//! just like the normal path does. Keep sections short: they hold off every
//! interrupt, including the tick.
//!
//! On the target the implementation comes from `cortex-m`
//! (`critical-section-single-core`: PRIMASK save/disable/restore); host
//! tests use the `critical-section` crate's `std` implementation.

use core::marker::PhantomData;

use critical_section::RestoreState;

/// RAII critical section. Interrupts are masked from `enter` until drop.
///
/// Guards nest; they must be dropped in reverse order of creation, which
/// scoping gives for free. Not `Send`: a section belongs to the context
/// that opened it.
pub struct CriticalSection {
    restore: RestoreState,
    _not_send: PhantomData<*mut ()>,
}

impl CriticalSection {
    #[inline]
    pub fn enter() -> Self {
        // Safety: the matching `release` runs in `Drop` with this state.
        let restore = unsafe { critical_section::acquire() };
        Self {
            restore,
            _not_send: PhantomData,
        }
    }

    /// Token for `critical_section::Mutex`, valid while the guard lives.
    #[inline]
    pub fn token(&self) -> critical_section::CriticalSection<'_> {
        // Safety: the section stays entered for the lifetime of `self`.
        unsafe { critical_section::CriticalSection::new() }
    }
}

impl Drop for CriticalSection {
    #[inline]
    fn drop(&mut self) {
        // Safety: `restore` came from the `acquire` in `enter`.
        unsafe { critical_section::release(self.restore) }
    }
}
