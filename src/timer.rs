//! # Software Timers
//!
//! Tick-driven one-shot timers kept in a list sorted by expiry tick.
//!
//! Nodes live in a fixed slab and link to each other by index. Insertion
//! splices a new timer in front of the first node that expires strictly
//! later, so timers due on the same tick fire in registration order.
//!
//! [`TimerService::check`] runs once per timer interrupt. It unlinks every
//! node whose expiry has been reached and returns their actions; running
//! them is left to the caller so no callback executes while the timer list
//! is locked.
//!
//! Handles carry a per-slot generation, so a [`TimerId`] whose timer fired
//! or was deleted never refers to a later timer reusing the same slot.

use crate::config::MAX_TIMERS;
use crate::error::{KernelError, Result};
use crate::task::TaskRef;

/// Callback run in trap context when a timer fires.
pub type TimerHandler = fn(usize);

#[derive(Debug, Clone, Copy)]
pub enum TimerAction {
    /// Call `handler(arg)`.
    Callback { handler: TimerHandler, arg: usize },
    /// Make a delayed task runnable again.
    Wake(TaskRef),
}

impl TimerAction {
    /// Run a callback action. Wake actions are left to the scheduler.
    pub fn run_callback(self) {
        if let TimerAction::Callback { handler, arg } = self {
            handler(arg);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    expiry: u64,
    action: TimerAction,
    next: Option<usize>,
}

pub struct TimerService {
    nodes: [Option<TimerNode>; MAX_TIMERS],
    generations: [u32; MAX_TIMERS],
    /// First (earliest) node.
    head: Option<usize>,
}

impl TimerService {
    pub const fn new() -> Self {
        Self {
            nodes: [None; MAX_TIMERS],
            generations: [0; MAX_TIMERS],
            head: None,
        }
    }

    /// Arm a timer calling `handler(arg)` at tick `now + timeout`.
    pub fn create(
        &mut self,
        handler: TimerHandler,
        arg: usize,
        timeout: u64,
        now: u64,
    ) -> Result<TimerId> {
        self.insert(TimerAction::Callback { handler, arg }, timeout, now)
    }

    /// Arm a timer that wakes `task` at tick `now + timeout`.
    pub fn create_wake(&mut self, task: TaskRef, timeout: u64, now: u64) -> Result<TimerId> {
        self.insert(TimerAction::Wake(task), timeout, now)
    }

    /// Disarm a pending timer.
    pub fn delete(&mut self, id: TimerId) -> Result<()> {
        if !self.is_armed(id) {
            return Err(KernelError::NoSuchTimer);
        }
        self.unlink(id.index);
        self.release(id.index);
        Ok(())
    }

    /// Remove every timer due at `now`, in firing order.
    pub fn check(&mut self, now: u64) -> Expired {
        let mut expired = Expired::new();
        while let Some(index) = self.head {
            let due = self.nodes[index].is_some_and(|node| node.expiry <= now);
            if !due {
                break;
            }
            if let Some(node) = self.nodes[index] {
                self.head = node.next;
                self.release(index);
                expired.push(node.action);
                log::trace!("timer {} fired at tick {} (due {})", index, now, node.expiry);
            }
        }
        expired
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        id.index < MAX_TIMERS
            && self.generations[id.index] == id.generation
            && self.nodes[id.index].is_some()
    }

    pub fn pending(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    pub fn next_expiry(&self) -> Option<u64> {
        self.head
            .and_then(|index| self.nodes[index])
            .map(|node| node.expiry)
    }

    /// Expiry ticks in list order.
    pub fn expiries(&self) -> impl Iterator<Item = u64> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let node = self.nodes[cursor?]?;
            cursor = node.next;
            Some(node.expiry)
        })
    }

    fn insert(&mut self, action: TimerAction, timeout: u64, now: u64) -> Result<TimerId> {
        if timeout == 0 {
            return Err(KernelError::InvalidArgument("zero timer timeout"));
        }
        let index = self
            .nodes
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TimerCapacity)?;
        let expiry = now.saturating_add(timeout);

        // Last node due at or before `expiry` becomes the predecessor.
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(node) = cursor.and_then(|i| self.nodes[i]) {
            if node.expiry > expiry {
                break;
            }
            prev = cursor;
            cursor = node.next;
        }

        self.nodes[index] = Some(TimerNode {
            expiry,
            action,
            next: cursor,
        });
        match prev.and_then(|p| self.nodes[p].as_mut()) {
            Some(node) => node.next = Some(index),
            None => self.head = Some(index),
        }

        Ok(TimerId {
            index,
            generation: self.generations[index],
        })
    }

    fn unlink(&mut self, index: usize) {
        let next = self.nodes[index].and_then(|node| node.next);
        if self.head == Some(index) {
            self.head = next;
            return;
        }
        let mut cursor = self.head;
        while let Some(i) = cursor {
            let Some(node) = self.nodes[i].as_mut() else {
                break;
            };
            if node.next == Some(index) {
                node.next = next;
                return;
            }
            cursor = node.next;
        }
    }

    fn release(&mut self, index: usize) {
        self.nodes[index] = None;
        self.generations[index] = self.generations[index].wrapping_add(1);
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

/// Actions of the timers removed by one [`TimerService::check`].
pub struct Expired {
    actions: [Option<TimerAction>; MAX_TIMERS],
    len: usize,
    pos: usize,
}

impl Expired {
    fn new() -> Self {
        Self {
            actions: [None; MAX_TIMERS],
            len: 0,
            pos: 0,
        }
    }

    fn push(&mut self, action: TimerAction) {
        self.actions[self.len] = Some(action);
        self.len += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.len
    }
}

impl Iterator for Expired {
    type Item = TimerAction;

    fn next(&mut self) -> Option<TimerAction> {
        if self.pos == self.len {
            return None;
        }
        let action = self.actions[self.pos].take();
        self.pos += 1;
        action
    }
}
