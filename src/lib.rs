//! # RVOS: a small RISC-V kernel core
//!
//! A single-hart, single-address-space kernel for the QEMU `virt` machine
//! running in machine mode. It provides preemptive priority scheduling,
//! physical page and heap allocation, software timers and a trap
//! dispatcher that ties the timer interrupt to the scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │                   Task API (api.rs)                    │
//! │   init · create_task · start · yield · exit · delay    │
//! ├──────────────┬──────────────┬──────────────────────────┤
//! │  Scheduler   │   Timers     │   Trap Dispatcher        │
//! │ scheduler.rs │  timer.rs    │   trap.rs                │
//! │ ─ create()   │ ─ create()   │  ─ software → dispatch   │
//! │ ─ dispatch() │ ─ delete()   │  ─ timer → check+dispatch│
//! │ ─ exit()     │ ─ check()    │  ─ external → PLIC       │
//! ├──────────────┴──────────────┴──────────────────────────┤
//! │      Kernel (kernel.rs)  ·  Sync (sync.rs)             │
//! ├────────────────────────────────────────────────────────┤
//! │   Heap (heap.rs): boundary tags over page-backed arena │
//! │   Pages (page.rs): descriptor bitmap, first fit        │
//! ├────────────────────────────────────────────────────────┤
//! │   Arch Port (arch/): trap vector, switch, CLINT, PLIC  │
//! ├────────────────────────────────────────────────────────┤
//! │              RV32IMAC hart, machine mode               │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! - **Strict priority**: priority 0 runs whenever it has a runnable task
//! - **Round robin** within a level: dispatch rotates the head to the tail
//! - **Per-task quantum**: each timer interrupt is armed with the timeslice
//!   of the task just dispatched
//! - **One decision point**: yield raises a software interrupt, so
//!   cooperative and preemptive switches go through the same dispatch
//!
//! ## Memory Model
//!
//! - The linker-provided heap region is managed in pages; its first bytes
//!   hold the page descriptors
//! - Task contexts come from the heap; stacks are static, one per
//!   priority/slot pair
//! - Run-queue links and timers live in fixed slabs addressed by index
//!
//! The hardware-independent modules build and test on the host; `arch`,
//! `logger` and `api` exist only for `riscv32` targets.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod heap;
pub mod kernel;
pub mod page;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod timer;
pub mod trap;

#[cfg(target_arch = "riscv32")]
pub mod api;
#[cfg(target_arch = "riscv32")]
pub mod arch;
#[cfg(target_arch = "riscv32")]
pub mod logger;

#[cfg(test)]
mod test_support;

pub use error::{KernelError, Result};
pub use kernel::Kernel;
