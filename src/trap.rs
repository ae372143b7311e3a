//! # Trap Dispatcher
//!
//! Classifies machine-mode traps and routes them to the scheduler, the timer
//! service and the external interrupt controller.
//!
//! ```text
//!               mcause
//!                 │
//!       ┌─────────┴──────────┐
//!   interrupt bit        exception
//!       │                    │
//!   ┌───┼──────────┐     log + Halt
//!   │   │          │
//!  MSI  MTI       MEI
//!   │   │          │
//!   │   ├ ticks += 1
//!   │   ├ fire due timers
//!   │   │          ├ claim / UART / complete
//!   └───┴► dispatch()     (no reschedule)
//!       └ MTI: arm next interrupt with the chosen task's timeslice
//! ```
//!
//! Hardware access goes through the [`Platform`] trait so the whole state
//! machine runs in host tests; the arch layer supplies the CLINT/PLIC/UART
//! implementation and applies the [`TrapOutcome`].

use core::ptr::NonNull;

use crate::config::UART0_IRQ;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::task::Context;
use crate::timer::TimerAction;

/// Set in `mcause` for asynchronous traps.
pub const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);

/// Bits of `mcause` holding the cause code.
pub const CAUSE_CODE_MASK: usize = 0xfff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Machine software interrupt (code 3), raised by `task_yield`.
    Software,
    /// Machine timer interrupt (code 7).
    Timer,
    /// Machine external interrupt (code 11), arbitrated by the PLIC.
    External,
    Unknown(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Interrupt(Interrupt),
    Exception(usize),
}

impl Trap {
    pub fn from_cause(mcause: usize) -> Self {
        let code = mcause & CAUSE_CODE_MASK;
        if mcause & INTERRUPT_BIT == 0 {
            return Trap::Exception(code);
        }
        Trap::Interrupt(match code {
            3 => Interrupt::Software,
            7 => Interrupt::Timer,
            11 => Interrupt::External,
            other => Interrupt::Unknown(other),
        })
    }
}

/// Board operations the dispatcher needs.
pub trait Platform {
    /// Acknowledge the machine software interrupt.
    fn clear_software_interrupt(&mut self);

    /// Schedule the next timer interrupt `interval` `mtime` ticks from now.
    fn arm_timer(&mut self, interval: u64);

    /// Highest-priority pending external source, if any.
    fn claim(&mut self) -> Option<u32>;

    fn complete(&mut self, irq: u32);

    fn uart_interrupt(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return from the trap, into this context if one was chosen or into the
    /// interrupted one otherwise.
    Resume(Option<NonNull<Context>>),
    /// Unrecoverable; the arch layer stops the hart.
    Halt(KernelError),
}

impl Kernel {
    /// Handle one trap. `epc` is the interrupted program counter.
    ///
    /// A timer interrupt re-arms the timer after dispatching, with the
    /// timeslice of the task about to be resumed: each quantum belongs to
    /// the task that runs during it.
    pub fn handle_trap<P: Platform>(
        &mut self,
        platform: &mut P,
        epc: usize,
        mcause: usize,
    ) -> TrapOutcome {
        match Trap::from_cause(mcause) {
            Trap::Interrupt(Interrupt::Software) => {
                platform.clear_software_interrupt();
                self.reschedule(|_| {})
            }
            Trap::Interrupt(Interrupt::Timer) => {
                self.ticks += 1;
                self.fire_timers();
                self.reschedule(|timeslice| platform.arm_timer(timeslice))
            }
            Trap::Interrupt(Interrupt::External) => {
                external_interrupt(platform);
                TrapOutcome::Resume(None)
            }
            Trap::Interrupt(Interrupt::Unknown(code)) => {
                log::warn!("unknown interrupt {} at {:#x}", code, epc);
                TrapOutcome::Resume(None)
            }
            Trap::Exception(code) => {
                log::error!("exception {} at {:#x}", code, epc);
                TrapOutcome::Halt(KernelError::Exception { code, epc })
            }
        }
    }

    fn reschedule(&mut self, on_dispatch: impl FnOnce(u64)) -> TrapOutcome {
        match self.scheduler.dispatch() {
            Ok(next) => {
                on_dispatch(next.timeslice);
                TrapOutcome::Resume(Some(next.context))
            }
            Err(err) => {
                log::error!("dispatch failed: {}", err);
                TrapOutcome::Halt(err)
            }
        }
    }

    /// Run every timer due at the current tick.
    ///
    /// A list locked by task context is left alone until the next tick.
    fn fire_timers(&mut self) {
        let Some(mut timers) = self.timers.try_lock() else {
            log::debug!("timer list busy at tick {}", self.ticks);
            return;
        };
        let expired = timers.check(self.ticks);
        drop(timers);

        for action in expired {
            match action {
                TimerAction::Wake(task) => {
                    if !self.scheduler.wake(task) {
                        log::debug!("{} gone before its wake-up", task.id);
                    }
                }
                callback => callback.run_callback(),
            }
        }
    }
}

fn external_interrupt<P: Platform>(platform: &mut P) {
    let Some(irq) = platform.claim() else {
        return;
    };
    if irq == UART0_IRQ {
        platform.uart_interrupt();
    } else {
        log::warn!("unexpected interrupt source {}", irq);
    }
    platform.complete(irq);
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
