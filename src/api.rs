//! # Task-Facing API
//!
//! Free functions over the single global [`Kernel`]. Every call made from a
//! task runs with interrupts masked (see [`sync::critical_section`]), so the
//! trap handler never observes a half-finished update and the timer list
//! lock is never held when a timer interrupt arrives.
//!
//! ```text
//!   task code ──► api::* ──critical_section──► Kernel
//!   trap vector ──► rvos_trap_handler ─────────► Kernel::handle_trap
//! ```

use core::ptr::{addr_of, addr_of_mut, NonNull};

use crate::arch::riscv32::{self, Board};
use crate::arch::uart;
use crate::config::{IDLE_PRIORITY, LOG_LEVEL, TIMER_INTERVAL};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::logger;
use crate::scheduler::StackPool;
use crate::sync;
use crate::task::{Context, TaskAbi, TaskEntry, TaskId};
use crate::timer::{TimerHandler, TimerId};
use crate::trap::{Platform, TrapOutcome, CAUSE_CODE_MASK};

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

/// Set once by [`init`]; touched only with interrupts masked or from trap
/// context.
static mut KERNEL: Option<Kernel> = None;

static mut STACKS: StackPool = StackPool::new();

extern "C" {
    // Heap region placed by the riscv-rt linker script.
    static _sheap: u8;
    static _eheap: u8;
}

/// # Safety
/// Interrupts must be masked, or the caller must be the trap handler.
unsafe fn kernel() -> Result<&'static mut Kernel> {
    (*addr_of_mut!(KERNEL))
        .as_mut()
        .ok_or(KernelError::NotInitialized)
}

fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> Result<R>) -> Result<R> {
    sync::critical_section(|_cs| {
        // Safety: interrupts are masked for the whole closure.
        let kernel = unsafe { kernel() }?;
        f(kernel)
    })
}

/// Log `err` and stop the hart.
fn halt(err: KernelError) -> ! {
    log::error!("kernel halted: {}", err);
    panic!("{}", err)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Bring up the UART, logging, trap vector and PLIC, and build the kernel
/// over the linker-provided heap region.
///
/// Must be called once, before any other function here, with interrupts
/// still masked.
pub fn init() -> Result<()> {
    uart::init();
    if logger::init(LOG_LEVEL).is_err() {
        return Err(KernelError::InvalidArgument("logger already installed"));
    }
    riscv32::init_traps();
    riscv32::plic_init();

    let abi = TaskAbi {
        return_address: task_return as usize,
        global_pointer: riscv32::global_pointer(),
    };

    sync::critical_section(|_cs| {
        // Safety: interrupts are masked and nothing else references the
        // globals before init completes.
        unsafe {
            if (*addr_of!(KERNEL)).is_some() {
                return Err(KernelError::InvalidArgument("kernel already initialized"));
            }
            let start = addr_of!(_sheap) as usize;
            let end = addr_of!(_eheap) as usize;
            let kernel = Kernel::new(start, end - start, &mut *addr_of_mut!(STACKS), abi)?;
            *addr_of_mut!(KERNEL) = Some(kernel);
        }
        Ok(())
    })
}

/// Register a task. `priority` 0 is the highest; a `timeslice` of 0 uses
/// the default quantum.
pub fn create_task(entry: TaskEntry, arg: usize, priority: u8, timeslice: u64) -> Result<TaskId> {
    with_kernel(|k| k.create_task(entry, arg, priority, timeslice))
}

/// Add the idle task, dispatch the first task and start preemption.
/// **Does not return.**
pub fn start() -> ! {
    let first = with_kernel(|k| {
        k.create_task(idle, 0, IDLE_PRIORITY, 0)?;
        k.start()
    });
    match first {
        Ok(first) => {
            riscv32::mask_interrupts();
            Board.arm_timer(TIMER_INTERVAL);
            riscv32::enable_interrupt_sources();
            // Safety: interrupts are masked and `first` is a live context.
            unsafe { riscv32::switch_to(first.context) }
        }
        Err(err) => halt(err),
    }
}

/// Give up the processor. Goes through the software interrupt so yielding
/// and preemption share one dispatch path.
pub fn task_yield() {
    riscv32::raise_software_interrupt();
}

/// Terminate the calling task. **Does not return.**
pub fn task_exit() -> ! {
    riscv32::mask_interrupts();
    // Safety: interrupts stay masked until `switch_to` enters the next task.
    let next = unsafe { kernel() }.and_then(|k| k.exit_current());
    match next {
        // Safety: the exited context is already freed; nothing is saved.
        Ok(next) => unsafe { riscv32::switch_to(next.context) },
        Err(err) => halt(err),
    }
}

/// Sleep for `ticks` timer interrupts without holding the processor.
pub fn task_delay(ticks: u64) -> Result<()> {
    with_kernel(|k| {
        k.delay_current(ticks)?;
        // Taken as soon as the critical section ends.
        riscv32::raise_software_interrupt();
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Call `handler(arg)` from the timer interrupt after `timeout` ticks.
pub fn timer_create(handler: TimerHandler, arg: usize, timeout: u64) -> Result<TimerId> {
    with_kernel(|k| k.timer_create(handler, arg, timeout))
}

pub fn timer_delete(timer: TimerId) -> Result<()> {
    with_kernel(|k| k.timer_delete(timer))
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

pub fn malloc(size: usize) -> Result<NonNull<u8>> {
    with_kernel(|k| k.malloc(size))
}

pub fn free(ptr: NonNull<u8>) -> Result<()> {
    with_kernel(|k| k.free(ptr))
}

pub fn page_alloc(npages: usize) -> Result<usize> {
    with_kernel(|k| k.page_alloc(npages))
}

pub fn page_free(addr: usize) -> Result<usize> {
    with_kernel(|k| k.page_free(addr))
}

/// Timer interrupts taken since `start`.
pub fn ticks() -> Result<u64> {
    with_kernel(|k| Ok(k.ticks()))
}

// ---------------------------------------------------------------------------
// Trap entry and task trampolines
// ---------------------------------------------------------------------------

/// Called by `rvos_trap_vector` with the interrupted task's registers saved.
/// Returns the context to resume.
#[no_mangle]
extern "C" fn rvos_trap_handler(epc: usize, mcause: usize) -> *mut Context {
    let interrupted = riscv32::current_context();
    // Safety: traps do not nest, and task code only touches the kernel with
    // interrupts masked.
    let outcome = match unsafe { kernel() } {
        Ok(kernel) => kernel.handle_trap(&mut Board, epc, mcause),
        Err(_) => TrapOutcome::Halt(KernelError::Exception {
            code: mcause & CAUSE_CODE_MASK,
            epc,
        }),
    };
    match outcome {
        TrapOutcome::Resume(Some(next)) => next.as_ptr(),
        TrapOutcome::Resume(None) => interrupted,
        TrapOutcome::Halt(err) => halt(err),
    }
}

/// Lowest-priority task; keeps dispatch from ever running dry.
extern "C" fn idle(_: usize) {
    loop {
        // Safety: `wfi` only stalls until the next interrupt.
        unsafe { riscv::asm::wfi() };
    }
}

/// Installed in every task's `ra`: returning from the entry function exits.
extern "C" fn task_return() -> ! {
    task_exit()
}
