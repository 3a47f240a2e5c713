//! # Round-Robin Demo
//!
//! Four tasks share UART0 under one kernel mutex:
//!
//! - tasks 1 and 3 at priority 6 take turns every second
//! - task 2 at priority 1 only runs when both are sleeping
//! - task 4, above everyone, waits on a channel that a recurring software
//!   timer signals every ten seconds
//!
//! Build for the MPS2 AN385 board and run under QEMU:
//! `cargo run --release --features rt --target thumbv7m-none-eabi --bin round_robin`

#![no_std]
#![no_main]

use core::cell::Cell;
use core::fmt::Write;

use cortex_m_rt::entry;
use critical_section::Mutex;
use panic_halt as _;

use lotos::config::ms_to_ticks;
use lotos::console::{CmsdkUart, Console, UART0_BASE, UART0_BAUD_DIVIDER};
use lotos::kernel;
use lotos::mutex::MutexId;
use lotos::notify::{ChannelId, NotifyMode};
use lotos::timer::IsrContext;
use lotos::{Fatal, KernelConfig, Policy, TaskConfig, Timeout};

const PERIOD_MS: u32 = 1000;
const ALARM_MS: u32 = 10_000;

/// Channel the alarm timer signals; set before the kernel starts.
static ALARM: Mutex<Cell<Option<ChannelId>>> = Mutex::new(Cell::new(None));

#[derive(Clone, Copy)]
struct Printer {
    text: &'static str,
    uart: CmsdkUart,
    lock: MutexId,
}

impl Printer {
    fn print(&self) {
        let mut console = Console::new(self.uart);
        match kernel::lock(self.lock, Timeout::Forever) {
            Ok(_guard) => {
                let _ = console.write_str(self.text);
            }
            Err(e) => {
                let _ = write!(console, "Error taking the mutex: {}\r\n", e);
            }
        }
    }
}

fn periodic(printer: Printer) {
    loop {
        printer.print();
        let _ = kernel::delay(ms_to_ticks(PERIOD_MS));
    }
}

fn on_alarm(printer: Printer) {
    let Some(alarm) = critical_section::with(|cs| ALARM.borrow(cs).get()) else {
        return;
    };
    loop {
        if kernel::wait(alarm, Timeout::Forever).is_ok() {
            printer.print();
        }
        let _ = kernel::delay(ms_to_ticks(PERIOD_MS));
    }
}

fn alarm_tick(ctx: &mut IsrContext<'_>) {
    if let Some(alarm) = critical_section::with(|cs| ALARM.borrow(cs).get()) {
        let _ = ctx.signal(alarm);
    }
}

fn report_fatal(fatal: &Fatal) -> ! {
    // Safety: the kernel is halting, no task will touch UART0 again.
    let uart = unsafe { CmsdkUart::new(UART0_BASE, UART0_BAUD_DIVIDER) };
    let _ = write!(Console::new(uart), "\r\n\r\n{}\r\n", fatal);
    lotos::arch::port::halt()
}

#[entry]
fn main() -> ! {
    // Safety: UART0 is only driven through copies of this handle, each
    // write made while holding `lock`.
    let uart = unsafe { CmsdkUart::new(UART0_BASE, UART0_BAUD_DIVIDER) };

    kernel::init(KernelConfig::new(Policy::RoundRobin).with_fatal_hook(report_fatal));

    let lock = kernel::mutex_create().expect("Failed to create UART mutex");
    let printer = |text: &'static str| Printer { text, uart, lock };

    kernel::spawn(
        TaskConfig::new("task1", 6),
        periodic,
        printer("Task 1 is running\r\n"),
    )
    .expect("Failed to create task1");
    kernel::spawn(
        TaskConfig::new("task2", 1),
        periodic,
        printer("Task 2 is running\r\n"),
    )
    .expect("Failed to create task2");
    kernel::spawn(
        TaskConfig::new("task3", 6),
        periodic,
        printer("Task 3 is running\r\n"),
    )
    .expect("Failed to create task3");
    let task4 = kernel::spawn(
        TaskConfig::new("task4", 7),
        on_alarm,
        printer("Time is up! Task 4 is running\r\n"),
    )
    .expect("Failed to create task4");

    let alarm = kernel::channel_create(task4, NotifyMode::Binary)
        .expect("Failed to create alarm channel");
    critical_section::with(|cs| ALARM.borrow(cs).set(Some(alarm)));

    let timer = kernel::timer_create(ms_to_ticks(ALARM_MS), true, alarm_tick)
        .expect("Failed to create alarm timer");
    kernel::timer_start(timer, None).expect("Failed to start alarm timer");

    kernel::start()
}
