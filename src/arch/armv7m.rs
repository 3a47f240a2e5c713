//! # ARMv7-M Port Layer
//!
//! Hardware-specific code for Cortex-M3/M4 (Thumb-2) processors.
//! Implements context switching via PendSV, the SysTick tick and the first
//! task launch.
//!
//! ## Context Switch Mechanism
//!
//! The port uses the split-stack model:
//! - **MSP** (Main Stack Pointer): `main`, the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): tasks in Thread mode
//!
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR on
//! the process stack. PendSV saves and restores R4–R11 around the call into
//! the scheduler, which completes the full context save/restore.
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority (0xFF), so neither
//! preempts the other or any application interrupt. A context switch
//! requested from any handler runs once all handlers have returned.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // Safety: called with interrupts disabled, before the first task runs.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pend a context switch. It runs as soon as no other handler is active
/// and interrupts are enabled.
#[inline]
pub fn request_context_switch() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// Startup and idle
// ---------------------------------------------------------------------------

/// Configure the tick, then enter the first task, whose initial frame
/// starts at `sp`. Called once from `kernel::start`.
pub fn launch(sp: usize) -> ! {
    cortex_m::interrupt::disable();
    // Safety: `main` has finished setup and nothing else touches SCB or
    // SYST from here on.
    let mut p = unsafe { cortex_m::Peripherals::steal() };
    set_interrupt_priorities(&mut p.SCB);
    configure_systick(&mut p.SYST);

    // Safety: `sp` is the saved stack pointer of a freshly launched task.
    unsafe { start_first_task(sp) }
}

/// Switch Thread mode to PSP and branch into the task at `sp`.
///
/// The frame is consumed by hand since this is not an exception return:
/// R0/R1 carry the trampoline arguments, LR the exit path.
///
/// # Safety
/// Must only be called once, with interrupts disabled and a frame built by
/// `TaskControlBlock::launch`.
unsafe fn start_first_task(sp: usize) -> ! {
    asm!(
        "adds r0, #32",        // skip the software-saved R4-R11
        "msr psp, r0",
        "movs r0, #2",         // CONTROL.SPSEL = 1
        "msr control, r0",
        "isb",
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR
        "mov lr, r4",
        "pop {{r4}}",          // PC
        "pop {{r5}}",          // xPSR, discarded
        "orr r4, r4, #1",      // Thumb state for bx
        "cpsie i",
        "bx r4",
        in("r0") sp,
        options(noreturn)
    );
}

/// Body of the idle task. Never blocks.
pub fn idle_entry(_: ()) {
    loop {
        cortex_m::asm::wfi();
    }
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Stop the CPU for good.
pub fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the actual context switch.
///
/// ## Sequence
/// 1. Save R4–R11 onto the current task's stack (PSP)
/// 2. Hand the updated PSP to the kernel, which stores it, runs the
///    scheduler and returns the next task's PSP
/// 3. Restore R4–R11 from the new task's stack
/// 4. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
///
/// Naked, so that the compiler stacks nothing of its own on top of the
/// task state.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "push {{r3, lr}}",     // EXC_RETURN; r3 keeps MSP 8-byte aligned
        "bl {switch}",
        "pop {{r3, lr}}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "bx lr",
        switch = sym switch_context,
    );
}

extern "C" fn switch_context(sp: usize) -> usize {
    crate::kernel::switch_context(sp)
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: scheduler tick entry point.
#[no_mangle]
pub extern "C" fn SysTick() {
    crate::kernel::on_tick();
}
