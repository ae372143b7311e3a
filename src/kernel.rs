//! # Kernel
//!
//! The [`Kernel`] value owns every piece of kernel state: the heap (and the
//! page allocator beneath it), the scheduler, the software timer list and
//! the tick counter. There are no hidden globals at this level; the arch
//! layer keeps the one instance in `api` and reaches it from trap context.
//!
//! ## Startup Sequence
//!
//! ```text
//! entry (riscv-rt)
//!   └─► main()
//!         ├─► api::init()         ← UART, logger, Kernel::new over the heap region
//!         ├─► api::create_task()  ← register tasks (×N)
//!         └─► api::start()        ← idle task, first dispatch, arm timer (no return)
//! ```
//!
//! From then on control reaches the kernel only through traps
//! ([`Kernel::handle_trap`]) and the task-facing calls in `api`, which mask
//! interrupts around every call into this type.

use core::ptr::NonNull;

use crate::error::{KernelError, Result};
use crate::heap::Heap;
use crate::page::PageAllocator;
use crate::scheduler::{Dispatch, Scheduler, StackPool};
use crate::sync::Spinlock;
use crate::task::{TaskAbi, TaskEntry, TaskId};
use crate::timer::{TimerHandler, TimerId, TimerService};

pub struct Kernel {
    pub(crate) heap: Heap,
    pub(crate) scheduler: Scheduler,
    /// Shared between trap context (`check`) and task context
    /// (`create`/`delete`).
    pub(crate) timers: Spinlock<TimerService>,
    /// Timer interrupts taken since start.
    pub(crate) ticks: u64,
}

impl Kernel {
    /// Build a kernel managing `[region_start, region_start + region_size)`.
    ///
    /// # Safety
    /// The region must be valid, writable, unused by anything else and must
    /// live as long as the kernel.
    pub unsafe fn new(
        region_start: usize,
        region_size: usize,
        stacks: &'static mut StackPool,
        abi: TaskAbi,
    ) -> Result<Self> {
        let pages = PageAllocator::new(region_start, region_size)?;
        log::info!(
            "kernel: {} pages of {} bytes at {:#x}",
            pages.num_pages(),
            crate::config::PAGE_SIZE,
            pages.alloc_start()
        );
        Ok(Self {
            heap: Heap::new(pages),
            scheduler: Scheduler::new(stacks, abi),
            timers: Spinlock::new(TimerService::new()),
            ticks: 0,
        })
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn create_task(
        &mut self,
        entry: TaskEntry,
        arg: usize,
        priority: u8,
        timeslice: u64,
    ) -> Result<TaskId> {
        self.scheduler
            .create(&mut self.heap, entry, arg, priority, timeslice)
    }

    /// First dispatch. Fails with `NoRunnableTask` if nothing was created.
    pub fn start(&mut self) -> Result<Dispatch> {
        let first = self.scheduler.dispatch()?;
        log::info!("kernel: starting {}", first.task.id);
        Ok(first)
    }

    pub fn yield_now(&mut self) -> Result<Dispatch> {
        self.scheduler.yield_current()
    }

    /// Retire the running task and pick its successor.
    ///
    /// The returned context must be switched to without saving the exiting
    /// task's registers: its context has already been freed.
    pub fn exit_current(&mut self) -> Result<Dispatch> {
        self.scheduler.exit(&mut self.heap)?;
        self.scheduler.dispatch()
    }

    /// Suspend the running task for `ticks` timer interrupts.
    ///
    /// The task is taken off its run queue immediately; the caller still has
    /// to reschedule. A zero delay does nothing.
    pub fn delay_current(&mut self, ticks: u64) -> Result<()> {
        if ticks == 0 {
            return Ok(());
        }
        let task = self.scheduler.block_current()?;
        let armed = self.timers.lock().create_wake(task, ticks, self.ticks);
        if let Err(err) = armed {
            self.scheduler.wake(task);
            return Err(err);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Run `handler(arg)` from the timer interrupt `timeout` ticks from now.
    pub fn timer_create(&self, handler: TimerHandler, arg: usize, timeout: u64) -> Result<TimerId> {
        self.timers.lock().create(handler, arg, timeout, self.ticks)
    }

    pub fn timer_delete(&self, timer: TimerId) -> Result<()> {
        self.timers.lock().delete(timer)
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.heap.malloc(size)
    }

    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        self.heap.free(ptr)
    }

    pub fn page_alloc(&mut self, npages: usize) -> Result<usize> {
        self.heap.pages_mut().alloc(npages)
    }

    /// Release pages from [`Kernel::page_alloc`], returning the page count.
    ///
    /// Pages backing the heap arena are never released this way.
    pub fn page_free(&mut self, addr: usize) -> Result<usize> {
        if self.heap.owns(addr) {
            log::warn!("page_free: {:#x} belongs to the kernel heap", addr);
            return Err(KernelError::InvalidAddress(addr));
        }
        match self.heap.pages_mut().free(addr) {
            Err(KernelError::InvalidAddress(addr)) => {
                log::warn!("page_free: {:#x} is not an allocation start", addr);
                Err(KernelError::InvalidAddress(addr))
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn timers(&self) -> &Spinlock<TimerService> {
        &self.timers
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_TASKS, MAX_TIMERS, NUM_PRIORITIES, PAGE_SIZE};
    use crate::task::TaskState;
    use crate::test_support::kernel;

    extern "C" fn entry(_: usize) {}
    fn noop(_: usize) {}

    #[test]
    fn test_start_requires_a_task() {
        let mut k = kernel(16);
        assert_eq!(k.start(), Err(KernelError::NoRunnableTask));

        let id = k.create_task(entry, 0, 3, 0).unwrap();
        assert_eq!(k.start().unwrap().task.id, id);
    }

    #[test]
    fn test_exit_hands_over_to_next_task() {
        let mut k = kernel(16);
        let a = k.create_task(entry, 0, 0, 0).unwrap();
        let b = k.create_task(entry, 0, 0, 0).unwrap();
        let idle = k.create_task(entry, 0, 7, 0).unwrap();

        assert_eq!(k.start().unwrap().task.id, a);
        assert_eq!(k.exit_current().unwrap().task.id, b);
        assert_eq!(k.exit_current().unwrap().task.id, idle);
        assert_eq!(k.scheduler().total_tasks(), 1);
    }

    #[test]
    fn test_delay_blocks_and_arms_wake() {
        let mut k = kernel(16);
        k.create_task(entry, 0, 0, 0).unwrap();
        k.create_task(entry, 0, 0, 0).unwrap();
        let running = k.start().unwrap().task;

        k.delay_current(3).unwrap();
        assert_eq!(k.scheduler().task(running).unwrap().state, TaskState::Blocked);
        assert_eq!(k.timers().lock().next_expiry(), Some(3));
        assert_ne!(k.yield_now().unwrap().task, running);
    }

    #[test]
    fn test_zero_delay_keeps_task_ready() {
        let mut k = kernel(16);
        k.create_task(entry, 0, 0, 0).unwrap();
        let running = k.start().unwrap().task;
        k.delay_current(0).unwrap();
        assert_eq!(k.scheduler().task(running).unwrap().state, TaskState::Running);
        assert_eq!(k.timers().lock().pending(), 0);
    }

    #[test]
    fn test_delay_failure_leaves_task_runnable() {
        let mut k = kernel(16);
        k.create_task(entry, 0, 0, 0).unwrap();
        let running = k.start().unwrap().task;
        for _ in 0..MAX_TIMERS {
            k.timer_create(noop, 0, 100).unwrap();
        }

        assert_eq!(k.delay_current(5), Err(KernelError::TimerCapacity));
        assert_eq!(k.scheduler().task(running).unwrap().state, TaskState::Ready);
        assert_eq!(k.yield_now().unwrap().task, running);
    }

    #[test]
    fn test_delay_without_running_task() {
        let mut k = kernel(16);
        assert_eq!(k.delay_current(1), Err(KernelError::NoCurrentTask));
    }

    #[test]
    fn test_timer_create_and_delete() {
        let k = kernel(16);
        let t = k.timer_create(noop, 7, 10).unwrap();
        assert!(k.timers().lock().is_armed(t));
        k.timer_delete(t).unwrap();
        assert_eq!(k.timer_delete(t), Err(KernelError::NoSuchTimer));
        assert_eq!(
            k.timer_create(noop, 7, 0),
            Err(KernelError::InvalidArgument("zero timer timeout"))
        );
    }

    #[test]
    fn test_memory_calls() {
        let mut k = kernel(16);
        let p = k.malloc(100).unwrap();
        assert!(k.heap().stats().used >= 100);
        k.free(p).unwrap();
        assert_eq!(k.heap().stats().used, 0);

        let free_before = k.heap().pages().free_pages();
        let pages = k.page_alloc(2).unwrap();
        assert_eq!(pages % PAGE_SIZE, 0);
        assert_eq!(k.heap().pages().free_pages(), free_before - 2);
        assert_eq!(
            k.page_free(pages + PAGE_SIZE),
            Err(KernelError::InvalidAddress(pages + PAGE_SIZE))
        );
        assert_eq!(k.page_free(pages), Ok(2));
        assert_eq!(k.page_free(0), Err(KernelError::InvalidAddress(0)));
    }

    #[test]
    fn test_page_free_refuses_heap_pages() {
        let mut k = kernel(16);
        k.create_task(entry, 0, 0, 0).unwrap();
        let arena = k.heap().arena_start();
        let free_before = k.heap().pages().free_pages();

        assert_eq!(k.page_free(arena), Err(KernelError::InvalidAddress(arena)));
        assert_eq!(k.heap().pages().free_pages(), free_before);
        let index = k.heap().pages().page_index(arena).unwrap();
        assert!(k.heap().pages().is_taken(index));
        assert_ne!(k.page_alloc(1), Ok(arena));
    }

    #[test]
    fn test_page_alloc_does_not_cap_the_heap() {
        let mut k = kernel(16);
        k.malloc(64).unwrap();
        let taken = k.page_alloc(1).unwrap();
        assert_eq!(taken, k.heap().high_water());

        for priority in 0..NUM_PRIORITIES as u8 {
            for _ in 0..MAX_TASKS {
                k.create_task(entry, 0, priority, 0).unwrap();
            }
        }
        assert_eq!(k.scheduler().total_tasks(), NUM_PRIORITIES * MAX_TASKS);
        assert!(k.heap().segments().len() >= 2);
        assert!(!k.heap().owns(taken));
        assert_eq!(k.page_free(taken), Ok(1));
    }
}
