//! # Lottery Demo
//!
//! Three equal-priority tasks hold 94, 5 and 1 tickets. Each one yields
//! after every turn; whichever task sees the total number of selections
//! cross a multiple of 10 000 prints the per-task counts, the cumulative
//! context-switch latency and the uptime.
//!
//! `cargo run --release --features rt --target thumbv7m-none-eabi --bin lottery`

#![no_std]
#![no_main]

use core::cell::Cell;
use core::fmt::Write;

use cortex_m_rt::entry;
use critical_section::Mutex;
use panic_halt as _;

use lotos::console::{CmsdkUart, Console, UART0_BASE, UART0_BAUD_DIVIDER};
use lotos::kernel;
use lotos::mutex::MutexId;
use lotos::stats::Snapshot;
use lotos::{KernelConfig, Policy, TaskConfig, TaskId, Timeout};

const REPORT_EVERY: u32 = 10_000;
const TICKETS: [u32; 3] = [94, 5, 1];

/// Reports printed so far.
static REPORTED: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));
static WORKERS: Mutex<Cell<[Option<TaskId>; 3]>> = Mutex::new(Cell::new([None; 3]));

#[derive(Clone, Copy)]
struct Reporter {
    uart: CmsdkUart,
    lock: MutexId,
}

impl Reporter {
    /// Claims the report for the current multiple of `REPORT_EVERY`.
    fn due(snap: &Snapshot) -> bool {
        let round = snap.total / REPORT_EVERY;
        critical_section::with(|cs| {
            let reported = REPORTED.borrow(cs);
            if round > reported.get() {
                reported.set(round);
                true
            } else {
                false
            }
        })
    }

    fn report(&self, snap: &Snapshot) {
        let Ok(_guard) = kernel::lock(self.lock, Timeout::Forever) else {
            return;
        };
        let workers = critical_section::with(|cs| WORKERS.borrow(cs).get());
        let mut console = Console::new(self.uart);
        for (n, worker) in workers.iter().enumerate() {
            if let Some(id) = worker {
                let _ = write!(
                    console,
                    "Task {} usage: {} out of {}\r\n",
                    n + 1,
                    snap.count(*id),
                    snap.total
                );
            }
        }
        let _ = write!(
            console,
            "Total Context Switch Time: {} ms\r\nTotal running time: {} ms\r\n\r\n",
            snap.cumulative_latency,
            kernel::now().unwrap_or_default()
        );
    }
}

fn worker(reporter: Reporter) {
    loop {
        if let Ok(snap) = kernel::stats() {
            if Reporter::due(&snap) {
                reporter.report(&snap);
            }
        }
        let _ = kernel::yield_now();
    }
}

#[entry]
fn main() -> ! {
    // Safety: UART0 is only driven through copies of this handle, each
    // write made while holding `lock`.
    let uart = unsafe { CmsdkUart::new(UART0_BASE, UART0_BAUD_DIVIDER) };

    kernel::init(KernelConfig::new(Policy::Lottery));

    let lock = kernel::mutex_create().expect("Failed to create UART mutex");
    let reporter = Reporter { uart, lock };

    let mut workers = [None; 3];
    for (n, (slot, tickets)) in workers.iter_mut().zip(TICKETS).enumerate() {
        const NAMES: [&str; 3] = ["task1", "task2", "task3"];
        let config = TaskConfig::new(NAMES[n], 6).with_tickets(tickets);
        *slot = Some(kernel::spawn(config, worker, reporter).expect("Failed to create task"));
    }
    critical_section::with(|cs| WORKERS.borrow(cs).set(workers));

    kernel::start()
}
