//! # Architecture Abstraction Layer
//!
//! Hardware boundary of the kernel. `port` is the ARMv7-M implementation on
//! bare-metal Arm targets and a hosted stand-in everywhere else; both
//! export the same functions:
//!
//! - `request_context_switch()`: pend a switch after the current section
//! - `launch(sp) -> !`: start the tick and enter the first task
//! - `idle_entry(())`: body of the idle task
//! - `wait_for_interrupt()`
//! - `halt() -> !`

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod armv7m;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use self::armv7m as port;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod hosted;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use self::hosted as port;
