//! # RVOS Configuration
//!
//! Compile-time constants governing memory management, scheduling and the
//! timer. All limits are fixed at build time; nothing here is runtime
//! configurable.

use log::LevelFilter;

/// Maximum number of tasks that may live at one priority level.
/// Each slot owns a dedicated `STACK_SIZE` stack in the stack pool.
pub const MAX_TASKS: usize = 8;

/// Number of strict priority levels. Priority 0 is the highest.
pub const NUM_PRIORITIES: usize = 8;

/// Priority used for the idle task created by `api::start`.
pub const IDLE_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;

/// Per-task stack size in bytes. Trap handling (including log formatting)
/// runs on the interrupted task's stack, so keep headroom for it.
pub const STACK_SIZE: usize = 2048;

/// log2 of the physical page size.
pub const PAGE_ORDER: usize = 12;

/// Physical page size managed by the page allocator.
pub const PAGE_SIZE: usize = 1 << PAGE_ORDER;

/// Alignment (and size granularity) of heap payloads.
pub const HEAP_ALIGN: usize = 8;

/// Separate page runs the heap arena may span before growth fails.
pub const MAX_HEAP_SEGMENTS: usize = 16;

/// Capacity of the software timer table.
pub const MAX_TIMERS: usize = 16;

/// CLINT `mtime` frequency on QEMU `virt` (10 MHz).
pub const CLINT_TIMEBASE_FREQ: u64 = 10_000_000;

/// `mtime` ticks until the first timer interrupt after start (10 ms).
pub const TIMER_INTERVAL: u64 = CLINT_TIMEBASE_FREQ / 100;

/// Quantum used when a task is created with a timeslice of 0.
pub const DEFAULT_TIMESLICE: u64 = TIMER_INTERVAL;

/// PLIC source number of UART0 on QEMU `virt`.
pub const UART0_IRQ: u32 = 10;

/// Maximum level emitted by the UART logger.
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;
