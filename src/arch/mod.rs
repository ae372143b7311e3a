//! # Architecture Layer
//!
//! Hardware-specific code for the QEMU `virt` RISC-V machine: CLINT timer
//! and software interrupts, the PLIC, the ns16550 UART and the assembly
//! halves of trap entry and context switch.
//!
//! Everything the trap dispatcher needs from the board is reached through
//! [`riscv32::Board`], its [`crate::trap::Platform`] implementation.

pub mod riscv32;
pub mod uart;
