//! # Scheduler
//!
//! Strict-priority, round-robin task scheduler.
//!
//! ## Scheduling Algorithm
//!
//! There is one FIFO run queue per priority level, 0 being the highest.
//! [`Scheduler::dispatch`] is the single scheduling decision shared by
//! cooperative yield and every preemption path:
//! 1. **Select**: the first priority, scanning from 0, whose queue is not empty
//! 2. **Rotate**: take that queue's head, detach it, re-append it at the tail
//! 3. **Resume**: hand the task's [`Context`] to the arch layer
//!
//! There is no aging. A runnable priority-0 task always wins over anything
//! below it; within one level tasks take strict turns.
//!
//! ## Queue Storage
//!
//! Each [`RunQueue`] is an index-linked list over a fixed arena of links with
//! two sentinels that never hold a task:
//!
//! ```text
//!   links[HEAD] ⇄ links[slot + 2] ⇄ ... ⇄ links[TAIL]
//! ```
//!
//! A task's slot also selects its stack in the [`StackPool`], so a slot freed
//! by `exit` hands its stack to the next task created at that priority.

use core::iter;
use core::ptr::NonNull;

use crate::config::{DEFAULT_TIMESLICE, MAX_TASKS, NUM_PRIORITIES, STACK_SIZE};
use crate::error::{KernelError, Result};
use crate::heap::Heap;
use crate::task::{Context, TaskAbi, TaskEntry, TaskId, TaskNode, TaskRef, TaskState};

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

/// One task stack, aligned for the RISC-V calling convention.
#[repr(C, align(16))]
pub struct TaskStack([u8; STACK_SIZE]);

impl TaskStack {
    pub const EMPTY: Self = Self([0; STACK_SIZE]);

    pub fn bottom(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// One past the highest byte; the initial stack pointer.
    pub fn top(&self) -> usize {
        self.bottom() + STACK_SIZE
    }
}

/// Dedicated stacks indexed by `[priority][slot]`.
pub struct StackPool {
    stacks: [[TaskStack; MAX_TASKS]; NUM_PRIORITIES],
}

impl StackPool {
    const ROW: [TaskStack; MAX_TASKS] = [TaskStack::EMPTY; MAX_TASKS];

    pub const fn new() -> Self {
        Self {
            stacks: [Self::ROW; NUM_PRIORITIES],
        }
    }

    pub fn stack(&self, priority: usize, slot: usize) -> &TaskStack {
        &self.stacks[priority][slot]
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Run queue
// ---------------------------------------------------------------------------

const HEAD: usize = 0;
const TAIL: usize = 1;
const LINKS: usize = MAX_TASKS + 2;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
}

/// Link index of a task slot.
#[inline]
const fn link(slot: usize) -> usize {
    slot + 2
}

struct RunQueue {
    links: [Link; LINKS],
    slots: [Option<TaskNode>; MAX_TASKS],
    /// Tasks currently linked between the sentinels.
    ready: usize,
    /// Occupied slots, blocked tasks included.
    count: usize,
}

impl RunQueue {
    const NO_TASK: Option<TaskNode> = None;

    fn new() -> Self {
        let mut links = [Link { prev: HEAD, next: TAIL }; LINKS];
        links[HEAD] = Link { prev: TAIL, next: TAIL };
        links[TAIL] = Link { prev: HEAD, next: HEAD };
        Self {
            links,
            slots: [Self::NO_TASK; MAX_TASKS],
            ready: 0,
            count: 0,
        }
    }

    fn push_back(&mut self, slot: usize) {
        self.link_before(link(slot), TAIL);
    }

    /// Link `slot` directly ahead of the linked slot `before`.
    fn insert_before(&mut self, slot: usize, before: usize) {
        self.link_before(link(slot), link(before));
    }

    fn link_before(&mut self, n: usize, at: usize) {
        let prev = self.links[at].prev;
        self.links[n] = Link { prev, next: at };
        self.links[prev].next = n;
        self.links[at].prev = n;
        self.ready += 1;
    }

    fn unlink(&mut self, slot: usize) {
        let Link { prev, next } = self.links[link(slot)];
        self.links[prev].next = next;
        self.links[next].prev = prev;
        self.ready -= 1;
    }

    fn front(&self) -> Option<usize> {
        let n = self.links[HEAD].next;
        (n != TAIL).then(|| n - 2)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Linked slots from head to tail.
    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        iter::successors(self.front(), move |&slot| {
            let n = self.links[link(slot)].next;
            (n != TAIL).then(|| n - 2)
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Result of a scheduling decision: who runs next and where to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub task: TaskRef,
    pub context: NonNull<Context>,
    /// Quantum to program into the timer compare register.
    pub timeslice: u64,
}

pub struct Scheduler {
    queues: [RunQueue; NUM_PRIORITIES],
    stacks: &'static mut StackPool,
    abi: TaskAbi,
    /// Most recently dispatched task that has not exited.
    current: Option<TaskRef>,
    next_id: u32,
}

impl Scheduler {
    pub fn new(stacks: &'static mut StackPool, abi: TaskAbi) -> Self {
        Self {
            queues: core::array::from_fn(|_| RunQueue::new()),
            stacks,
            abi,
            current: None,
            next_id: 0,
        }
    }

    /// Create a task and append it at the tail of its priority's queue.
    ///
    /// A `timeslice` of 0 selects [`DEFAULT_TIMESLICE`]. The context is
    /// allocated from `heap`; the stack comes from the task's slot.
    pub fn create(
        &mut self,
        heap: &mut Heap,
        entry: TaskEntry,
        arg: usize,
        priority: u8,
        timeslice: u64,
    ) -> Result<TaskId> {
        let queue = self
            .queues
            .get_mut(priority as usize)
            .ok_or(KernelError::InvalidPriority(priority))?;
        let slot = queue.free_slot().ok_or_else(|| {
            log::warn!("priority {} is full", priority);
            KernelError::TaskCapacity(priority)
        })?;

        let stack_top = self.stacks.stack(priority as usize, slot).top();
        let context = heap.alloc_object(Context::new(entry, arg, stack_top, self.abi))?;

        let id = TaskId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        queue.slots[slot] = Some(TaskNode {
            id,
            context,
            timeslice: if timeslice == 0 { DEFAULT_TIMESLICE } else { timeslice },
            state: TaskState::Ready,
        });
        queue.count += 1;
        queue.push_back(slot);

        log::debug!("{} created at priority {} slot {}", id, priority, slot);
        Ok(id)
    }

    /// Pick the next task to run and rotate it to the tail of its queue.
    pub fn dispatch(&mut self) -> Result<Dispatch> {
        let (priority, slot) = self
            .queues
            .iter()
            .enumerate()
            .find_map(|(priority, queue)| queue.front().map(|slot| (priority, slot)))
            .ok_or(KernelError::NoRunnableTask)?;

        if let Some(prev) = self.current {
            if let Some(node) = self.node_mut(prev) {
                if node.state == TaskState::Running {
                    node.state = TaskState::Ready;
                }
            }
        }

        let queue = &mut self.queues[priority];
        queue.unlink(slot);
        queue.push_back(slot);

        let node = queue.slots[slot]
            .as_mut()
            .ok_or(KernelError::NoRunnableTask)?;
        node.state = TaskState::Running;

        let task = TaskRef {
            priority: priority as u8,
            slot,
            id: node.id,
        };
        self.current = Some(task);
        Ok(Dispatch {
            task,
            context: node.context,
            timeslice: node.timeslice,
        })
    }

    /// Give up the processor: the same decision as [`Scheduler::dispatch`].
    #[inline]
    pub fn yield_current(&mut self) -> Result<Dispatch> {
        self.dispatch()
    }

    /// Remove the running task and release its context.
    ///
    /// Only the current task can exit; there is no way to terminate another.
    pub fn exit(&mut self, heap: &mut Heap) -> Result<TaskId> {
        let task = self.current.ok_or(KernelError::NoCurrentTask)?;
        let queue = &mut self.queues[task.priority as usize];
        let node = match queue.slots[task.slot].take() {
            Some(node) if node.id == task.id => node,
            other => {
                queue.slots[task.slot] = other;
                return Err(KernelError::NoCurrentTask);
            }
        };

        if node.state != TaskState::Blocked {
            queue.unlink(task.slot);
        }
        queue.count -= 1;
        self.current = None;

        // Safety: the context was created by `alloc_object` in `create` and
        // its only reference was the node just removed.
        unsafe { heap.free_object(node.context)? };

        log::debug!("{} exited", task.id);
        Ok(task.id)
    }

    /// Detach the running task from its queue until [`Scheduler::wake`].
    ///
    /// The task keeps executing until the next dispatch picks someone else.
    pub fn block_current(&mut self) -> Result<TaskRef> {
        let task = self.current.ok_or(KernelError::NoCurrentTask)?;
        let queue = &mut self.queues[task.priority as usize];
        let node = queue.slots[task.slot]
            .as_mut()
            .filter(|node| node.id == task.id)
            .ok_or(KernelError::NoCurrentTask)?;

        if node.state != TaskState::Blocked {
            node.state = TaskState::Blocked;
            queue.unlink(task.slot);
        }
        Ok(task)
    }

    /// Re-queue a blocked task. Returns `false` when the task is gone or was
    /// not blocked.
    ///
    /// The woken task goes ahead of the running task when both share a
    /// priority, so the running task stays last in line and the next
    /// dispatch still rotates away from it. Otherwise it joins the tail.
    pub fn wake(&mut self, task: TaskRef) -> bool {
        let running = self
            .current
            .filter(|cur| cur.priority == task.priority && cur.slot != task.slot)
            .filter(|&cur| {
                self.task(cur)
                    .is_some_and(|node| node.state != TaskState::Blocked)
            });
        let Some(queue) = self.queues.get_mut(task.priority as usize) else {
            return false;
        };
        match queue.slots.get_mut(task.slot).and_then(Option::as_mut) {
            Some(node) if node.id == task.id && node.state == TaskState::Blocked => {
                node.state = TaskState::Ready;
            }
            _ => return false,
        }
        match running {
            Some(cur) => queue.insert_before(task.slot, cur.slot),
            None => queue.push_back(task.slot),
        }
        true
    }

    pub fn current(&self) -> Option<TaskRef> {
        self.current
    }

    pub fn task(&self, task: TaskRef) -> Option<&TaskNode> {
        self.queues
            .get(task.priority as usize)?
            .slots
            .get(task.slot)?
            .as_ref()
            .filter(|node| node.id == task.id)
    }

    /// Live tasks at `priority`, blocked ones included.
    pub fn task_count(&self, priority: u8) -> usize {
        self.queues
            .get(priority as usize)
            .map_or(0, |queue| queue.count)
    }

    pub fn total_tasks(&self) -> usize {
        self.queues.iter().map(|queue| queue.count).sum()
    }

    /// Tasks linked into any run queue.
    pub fn ready_count(&self) -> usize {
        self.queues.iter().map(|queue| queue.ready).sum()
    }

    /// Ids at `priority` in queue order, head first.
    pub fn queue_order(&self, priority: u8) -> impl Iterator<Item = TaskId> + '_ {
        self.queues
            .get(priority as usize)
            .into_iter()
            .flat_map(|queue| {
                queue
                    .iter()
                    .filter_map(move |slot| queue.slots[slot].as_ref().map(|node| node.id))
            })
    }

    pub fn stacks(&self) -> &StackPool {
        self.stacks
    }

    fn node_mut(&mut self, task: TaskRef) -> Option<&mut TaskNode> {
        self.queues
            .get_mut(task.priority as usize)?
            .slots
            .get_mut(task.slot)?
            .as_mut()
            .filter(|node| node.id == task.id)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
