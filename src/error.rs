//! Kernel error type.
//!
//! Every fallible kernel operation returns [`Result`]. Allocation and capacity
//! exhaustion are ordinary errors the caller is expected to handle; only
//! synchronous exceptions are fatal, and those are reported to the arch layer
//! as [`KernelError::Exception`] before it halts.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// The page or heap allocator could not satisfy a request.
    #[error("out of memory")]
    OutOfMemory,

    /// Every task slot at this priority is occupied.
    #[error("priority {0} has no free task slot")]
    TaskCapacity(u8),

    #[error("priority {0} is out of range")]
    InvalidPriority(u8),

    /// The software timer table is full.
    #[error("timer table is full")]
    TimerCapacity,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The address is null, outside the managed range, or not the start of
    /// a live allocation.
    #[error("address {0:#x} is not a live allocation")]
    InvalidAddress(usize),

    /// The timer was deleted or has already fired.
    #[error("no such timer")]
    NoSuchTimer,

    #[error("no runnable task")]
    NoRunnableTask,

    #[error("no task is running")]
    NoCurrentTask,

    /// The global kernel instance has not been set up by `api::init`.
    #[error("kernel not initialized")]
    NotInitialized,

    /// A synchronous exception. Never resumable.
    #[error("unrecoverable exception {code} at {epc:#x}")]
    Exception { code: usize, epc: usize },
}

pub type Result<T> = core::result::Result<T, KernelError>;
