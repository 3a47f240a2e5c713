//! Hosted stand-in for the port layer.
//!
//! Lets the kernel build and its scheduling logic run under `cargo test` on
//! a development machine. There is no second stack to switch to, so the
//! entry points that would hand over the CPU panic.

/// Nothing to pend: tests call `Scheduler::schedule` themselves.
#[inline]
pub fn request_context_switch() {}

pub fn launch(_sp: usize) -> ! {
    panic!("tasks can only be launched on the target");
}

pub fn idle_entry(_: ()) {
    loop {
        core::hint::spin_loop();
    }
}

#[inline]
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn halt() -> ! {
    panic!("kernel halted");
}
