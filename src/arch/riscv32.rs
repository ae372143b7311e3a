//! # RISC-V Port Layer (QEMU `virt`, RV32, machine mode)
//!
//! Implements trap entry/exit, the first switch into a task and the board
//! peripherals the dispatcher drives.
//!
//! ## Context Switch Mechanism
//!
//! `mscratch` always holds the [`Context`] of the task that is running.
//! On a trap, `rvos_trap_vector`:
//! 1. Swaps `t6` with `mscratch` to get the context pointer
//! 2. Stores every general register into that context, `mepc` into `pc`
//! 3. Calls `rvos_trap_handler(mepc, mcause)` on the interrupted stack
//! 4. Installs the returned context in `mscratch` and `mepc`
//! 5. Reloads every register from it and `mret`s
//!
//! A trap that does not reschedule returns the context it was given, so the
//! same path resumes the interrupted task.
//!
//! ## Memory Map
//!
//! ```text
//!  0x0200_0000  CLINT  msip, mtimecmp, mtime
//!  0x0c00_0000  PLIC   priorities, enables, threshold, claim/complete
//!  0x1000_0000  UART0  ns16550a
//!  0x8000_0000  RAM
//! ```

use core::arch::{asm, global_asm};
use core::ptr::{read_volatile, write_volatile, NonNull};

use riscv::register::mtvec::{self, TrapMode};
use riscv::register::{mie, mscratch, mstatus};

use crate::config::UART0_IRQ;
use crate::task::{Context, CONTEXT_WORDS};
use crate::trap::Platform;

pub const UART0: usize = 0x1000_0000;

pub const CLINT: usize = 0x0200_0000;
const CLINT_MSIP: usize = CLINT;
const CLINT_MTIMECMP: usize = CLINT + 0x4000;
const CLINT_MTIME: usize = CLINT + 0xbff8;

pub const PLIC: usize = 0x0c00_0000;
const PLIC_PRIORITY: usize = PLIC;
const PLIC_MENABLE: usize = PLIC + 0x2000;
const PLIC_MTHRESHOLD: usize = PLIC + 0x20_0000;
const PLIC_MCLAIM: usize = PLIC + 0x20_0004;

// ---------------------------------------------------------------------------
// Trap vector and context switch
// ---------------------------------------------------------------------------

// Register offsets match `task::Context` on RV32 (word = 4 bytes).
global_asm!(
    r#"
.macro save_gp base
    sw ra,   0(\base)
    sw sp,   4(\base)
    sw gp,   8(\base)
    sw tp,  12(\base)
    sw t0,  16(\base)
    sw t1,  20(\base)
    sw t2,  24(\base)
    sw s0,  28(\base)
    sw s1,  32(\base)
    sw a0,  36(\base)
    sw a1,  40(\base)
    sw a2,  44(\base)
    sw a3,  48(\base)
    sw a4,  52(\base)
    sw a5,  56(\base)
    sw a6,  60(\base)
    sw a7,  64(\base)
    sw s2,  68(\base)
    sw s3,  72(\base)
    sw s4,  76(\base)
    sw s5,  80(\base)
    sw s6,  84(\base)
    sw s7,  88(\base)
    sw s8,  92(\base)
    sw s9,  96(\base)
    sw s10, 100(\base)
    sw s11, 104(\base)
    sw t3, 108(\base)
    sw t4, 112(\base)
    sw t5, 116(\base)
.endm

.macro load_gp base
    lw ra,   0(\base)
    lw sp,   4(\base)
    lw gp,   8(\base)
    lw tp,  12(\base)
    lw t0,  16(\base)
    lw t1,  20(\base)
    lw t2,  24(\base)
    lw s0,  28(\base)
    lw s1,  32(\base)
    lw a0,  36(\base)
    lw a1,  40(\base)
    lw a2,  44(\base)
    lw a3,  48(\base)
    lw a4,  52(\base)
    lw a5,  56(\base)
    lw a6,  60(\base)
    lw a7,  64(\base)
    lw s2,  68(\base)
    lw s3,  72(\base)
    lw s4,  76(\base)
    lw s5,  80(\base)
    lw s6,  84(\base)
    lw s7,  88(\base)
    lw s8,  92(\base)
    lw s9,  96(\base)
    lw s10, 100(\base)
    lw s11, 104(\base)
    lw t3, 108(\base)
    lw t4, 112(\base)
    lw t5, 116(\base)
.endm

.section .text.rvos_trap, "ax"
.global rvos_trap_vector
.balign 4
rvos_trap_vector:
    csrrw t6, mscratch, t6
    save_gp t6
    mv t5, t6
    csrr t6, mscratch
    sw t6, 120(t5)
    csrw mscratch, t5

    csrr a0, mepc
    sw a0, 124(t5)
    csrr a1, mcause
    call rvos_trap_handler

    csrw mscratch, a0
    lw t0, 124(a0)
    csrw mepc, t0
    mv t6, a0
    load_gp t6
    lw t6, 120(t6)
    mret

.global rvos_switch_to
.balign 4
rvos_switch_to:
    csrw mscratch, a0
    lw t0, 124(a0)
    csrw mepc, t0
    li t0, 0x1880
    csrs mstatus, t0
    mv t6, a0
    load_gp t6
    lw t6, 120(t6)
    mret
"#
);

extern "C" {
    fn rvos_trap_vector();
    fn rvos_switch_to(context: *mut Context) -> !;
}

/// Scratch context for traps taken before the first task runs.
static mut BOOT_CONTEXT: [usize; CONTEXT_WORDS] = [0; CONTEXT_WORDS];

/// Install the trap vector and the boot scratch context.
pub fn init_traps() {
    // Safety: single hart, interrupts are still masked during init.
    unsafe {
        mscratch::write(core::ptr::addr_of_mut!(BOOT_CONTEXT) as usize);
        mtvec::write(rvos_trap_vector as usize, TrapMode::Direct);
    }
}

/// Enable the machine software, timer and external interrupt sources.
///
/// Global `mstatus.MIE` is left to the first `mret` into a task.
pub fn enable_interrupt_sources() {
    // Safety: the trap vector and scratch context are installed.
    unsafe {
        mie::set_msoft();
        mie::set_mtimer();
        mie::set_mext();
    }
}

/// Clear `mstatus.MIE`. Used on paths that end in [`switch_to`], which
/// re-enables interrupts through `mret`.
pub fn mask_interrupts() {
    // Safety: masking interrupts cannot break any invariant.
    unsafe { mstatus::clear_mie() }
}

/// Resume `context` with interrupts enabled. Never returns.
///
/// # Safety
/// `context` must be a live task context and interrupts must be masked.
pub unsafe fn switch_to(context: NonNull<Context>) -> ! {
    rvos_switch_to(context.as_ptr())
}

/// Context the running task's registers are saved into.
pub fn current_context() -> *mut Context {
    mscratch::read() as *mut Context
}

/// Value of `gp`, inherited by every task.
pub fn global_pointer() -> usize {
    let gp: usize;
    // Safety: reads a register, no side effects.
    unsafe { asm!("mv {}, gp", out(reg) gp, options(nomem, nostack)) };
    gp
}

// ---------------------------------------------------------------------------
// CLINT
// ---------------------------------------------------------------------------

/// Current `mtime`, read consistently on a 32-bit hart.
pub fn mtime() -> u64 {
    // Safety: fixed CLINT MMIO registers.
    unsafe {
        loop {
            let hi = read_volatile((CLINT_MTIME + 4) as *const u32);
            let lo = read_volatile(CLINT_MTIME as *const u32);
            if hi == read_volatile((CLINT_MTIME + 4) as *const u32) {
                return (u64::from(hi) << 32) | u64::from(lo);
            }
        }
    }
}

fn set_mtimecmp(value: u64) {
    // Safety: fixed CLINT MMIO registers. Raising the low half first keeps
    // the intermediate value from triggering early.
    unsafe {
        write_volatile(CLINT_MTIMECMP as *mut u32, u32::MAX);
        write_volatile((CLINT_MTIMECMP + 4) as *mut u32, (value >> 32) as u32);
        write_volatile(CLINT_MTIMECMP as *mut u32, value as u32);
    }
}

/// Pend a machine software interrupt on this hart.
pub fn raise_software_interrupt() {
    // Safety: fixed CLINT MMIO register.
    unsafe { write_volatile(CLINT_MSIP as *mut u32, 1) }
}

// ---------------------------------------------------------------------------
// PLIC
// ---------------------------------------------------------------------------

/// Route UART0 to hart 0 machine mode.
pub fn plic_init() {
    // Safety: fixed PLIC MMIO registers.
    unsafe {
        write_volatile((PLIC_PRIORITY + UART0_IRQ as usize * 4) as *mut u32, 1);
        let enable = read_volatile(PLIC_MENABLE as *const u32);
        write_volatile(PLIC_MENABLE as *mut u32, enable | (1 << UART0_IRQ));
        write_volatile(PLIC_MTHRESHOLD as *mut u32, 0);
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// QEMU `virt` implementation of the dispatcher's hardware needs.
pub struct Board;

impl Platform for Board {
    fn clear_software_interrupt(&mut self) {
        // Safety: fixed CLINT MMIO register.
        unsafe { write_volatile(CLINT_MSIP as *mut u32, 0) }
    }

    fn arm_timer(&mut self, interval: u64) {
        set_mtimecmp(mtime().wrapping_add(interval));
    }

    fn claim(&mut self) -> Option<u32> {
        // Safety: fixed PLIC MMIO register.
        let irq = unsafe { read_volatile(PLIC_MCLAIM as *const u32) };
        (irq != 0).then_some(irq)
    }

    fn complete(&mut self, irq: u32) {
        // Safety: fixed PLIC MMIO register.
        unsafe { write_volatile(PLIC_MCLAIM as *mut u32, irq) }
    }

    fn uart_interrupt(&mut self) {
        super::uart::isr();
    }
}
