//! # Task Model
//!
//! Types shared by the scheduler, the trap dispatcher and the arch layer:
//! the saved register file ([`Context`]), task identity and the run-queue
//! node that ties a task to its context.
//!
//! ## Context ABI
//!
//! [`Context`] is read and written by the trap vector in assembly. Its field
//! order is a fixed contract: register `x` lives at byte offset
//! `index * WORD`, with the resume address in the final slot.
//!
//! ```text
//!  word  0   ra        word 16   a7
//!  word  1   sp        word 17   s2
//!  word  2   gp         ...
//!  word  3   tp        word 26   s11
//!  word  4-6 t0..t2    word 27   t3
//!  word  7   s0        word 30   t6
//!  word  8   s1        word 31   pc (resume address, from mepc)
//!  word  9   a0
//! ```

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

/// Task entry point. The argument arrives in `a0`.
pub type TaskEntry = extern "C" fn(usize);

/// Register width in bytes.
pub const WORD: usize = size_of::<usize>();

/// Number of words in a [`Context`].
pub const CONTEXT_WORDS: usize = 32;

// ---------------------------------------------------------------------------
// Saved register file
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    /// Where execution resumes on the next switch into this task.
    pub pc: usize,
}

const_assert_eq!(size_of::<Context>(), CONTEXT_WORDS * WORD);
const_assert_eq!(core::mem::offset_of!(Context, a0), 9 * WORD);
const_assert_eq!(core::mem::offset_of!(Context, t6), 30 * WORD);
const_assert_eq!(core::mem::offset_of!(Context, pc), 31 * WORD);

impl Context {
    /// Initial register file for a task that has never run.
    ///
    /// The stack pointer is rounded down to the 16-byte alignment the
    /// RISC-V calling convention requires.
    pub fn new(entry: TaskEntry, arg: usize, stack_top: usize, abi: TaskAbi) -> Self {
        Self {
            ra: abi.return_address,
            sp: stack_top & !0xf,
            gp: abi.global_pointer,
            a0: arg,
            pc: entry as usize,
            ..Self::default()
        }
    }
}

/// Values every new task inherits from the running kernel image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskAbi {
    /// Installed in `ra`, so returning from the entry function lands here.
    pub return_address: usize,
    /// Installed in `gp` for linker relaxation.
    pub global_pointer: usize,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Kernel-wide unique task id. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Where a task lives: its priority queue and slot. The id guards against a
/// slot that has since been reused by another task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRef {
    pub priority: u8,
    pub slot: usize,
    pub id: TaskId,
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// ```text
///   ┌──────────┐     dispatch()     ┌─────────┐
///   │  Ready   │ ─────────────────► │ Running │
///   └──────────┘                    └─────────┘
///        ▲   ▲     next dispatch()       │
///        │   └───────────────────────────┤
///        │ wake()                        │ block_current()
///        │         ┌──────────┐          │
///        └──────── │ Blocked  │ ◄────────┘
///                  └──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Linked into its run queue, waiting for the processor.
    Ready,
    /// Most recently dispatched; sits just before its queue's tail sentinel.
    Running,
    /// Detached from the run queue until woken.
    Blocked,
}

// ---------------------------------------------------------------------------
// Task node
// ---------------------------------------------------------------------------

/// Per-task record held in a run-queue slot.
#[derive(Debug)]
pub struct TaskNode {
    pub id: TaskId,
    /// Heap-allocated register file, owned by the scheduler.
    pub context: NonNull<Context>,
    /// `mtime` ticks between forced preemptions while this task runs.
    pub timeslice: u64,
    pub state: TaskState,
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn entry(_: usize) {}

    #[test]
    fn test_context_layout() {
        assert_eq!(size_of::<Context>(), CONTEXT_WORDS * WORD);
        assert_eq!(core::mem::offset_of!(Context, ra), 0);
        assert_eq!(core::mem::offset_of!(Context, sp), WORD);
        assert_eq!(core::mem::offset_of!(Context, s2), 17 * WORD);
        assert_eq!(core::mem::offset_of!(Context, t3), 27 * WORD);
    }

    #[test]
    fn test_new_context() {
        let abi = TaskAbi {
            return_address: 0x8000_1000,
            global_pointer: 0x8000_2000,
        };
        let ctx = Context::new(entry, 42, 0x8010_0007, abi);

        assert_eq!(ctx.pc, entry as usize);
        assert_eq!(ctx.a0, 42);
        assert_eq!(ctx.sp, 0x8010_0000);
        assert_eq!(ctx.ra, 0x8000_1000);
        assert_eq!(ctx.gp, 0x8000_2000);
        assert_eq!(ctx.s0, 0);
        assert_eq!(ctx.t6, 0);
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(std::format!("{}", TaskId(7)), "task#7");
    }
}
