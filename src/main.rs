//! # RVOS Demo Firmware
//!
//! Runs on `qemu-system-riscv32 -machine virt` and exercises each kernel
//! service:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `counter(3)` | 1 | Prints and sleeps, exits after 3 rounds |
//! | `counter(10)` | 1 | Same, exits after 10 rounds |
//! | `lock_worker` ×2 | 2 | Increment a shared counter under a spinlock |
//! | `timer_user` | 2 | Arms one-shot timers and counts their callbacks |
//! | `allocator_user` | 3 | Cycles heap and page allocations |
//!
//! An idle task at the lowest priority is added by `api::start`.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicUsize, Ordering};

use panic_halt as _;
use riscv_rt::entry;

use rvos::api;
use rvos::sync::Spinlock;
use rvos::task::TaskEntry;

const DELAY: u64 = 20;

static SHARED: Spinlock<u32> = Spinlock::new(0);
static TIMEOUTS: AtomicUsize = AtomicUsize::new(0);

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// Print `rounds` times with a delay in between, then return (and exit).
extern "C" fn counter(rounds: usize) {
    for i in 1..=rounds {
        log::info!("counter({}): round {}", rounds, i);
        if let Err(err) = api::task_delay(DELAY) {
            log::warn!("counter({}): delay failed: {}", rounds, err);
        }
    }
    match api::ticks() {
        Ok(now) => log::info!("counter({}): done at tick {}", rounds, now),
        Err(err) => log::warn!("counter({}): {}", rounds, err),
    }
}

/// Two instances contend on `SHARED`; neither yields while holding it.
extern "C" fn lock_worker(id: usize) {
    loop {
        {
            let mut value = SHARED.lock();
            *value += 1;
            log::info!("lock_worker {}: shared = {}", id, *value);
        }
        let _ = api::task_delay(DELAY);
    }
}

fn on_timeout(arg: usize) {
    let fired = TIMEOUTS.fetch_add(1, Ordering::Relaxed) + 1;
    log::info!("timeout #{} (arg {})", fired, arg);
}

extern "C" fn timer_user(_: usize) {
    let mut round = 0;
    loop {
        round += 1;
        match api::timer_create(on_timeout, round, 5) {
            Ok(_) => {}
            Err(err) => log::warn!("timer_user: {}", err),
        }
        // A timer that never gets to fire.
        if let Ok(cancelled) = api::timer_create(on_timeout, usize::MAX, 1_000) {
            let _ = api::timer_delete(cancelled);
        }
        let _ = api::task_delay(DELAY);
    }
}

extern "C" fn allocator_user(_: usize) {
    loop {
        match (api::malloc(64), api::page_alloc(2)) {
            (Ok(block), Ok(pages)) => {
                log::info!("allocator_user: block {:p}, pages {:#x}", block, pages);
                let _ = api::free(block);
                let _ = api::page_free(pages);
            }
            (block, pages) => {
                log::warn!("allocator_user: allocation failed");
                if let Ok(block) = block {
                    let _ = api::free(block);
                }
                if let Ok(pages) = pages {
                    let _ = api::page_free(pages);
                }
            }
        }
        api::task_yield();
        let _ = api::task_delay(DELAY);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    api::init().expect("kernel init failed");
    log::info!("rvos: booting");

    let tasks: [(TaskEntry, usize, u8, u64); 6] = [
        (counter, 3, 1, 0),
        (counter, 10, 1, 0),
        (lock_worker, 0, 2, 0),
        (lock_worker, 1, 2, 0),
        (timer_user, 0, 2, 0),
        (allocator_user, 0, 3, 0),
    ];
    for (entry, arg, priority, timeslice) in tasks {
        api::create_task(entry, arg, priority, timeslice).expect("failed to create task");
    }

    api::start()
}
