//! Host-side helpers for unit tests: leaked, page-aligned memory standing in
//! for the linker-provided heap region and the static stack pool.

use std::alloc::{alloc_zeroed, Layout};
use std::boxed::Box;

use crate::config::PAGE_SIZE;
use crate::kernel::Kernel;
use crate::scheduler::StackPool;
use crate::task::TaskAbi;

/// A region that yields exactly `pages` allocatable pages: one leading page
/// for the descriptors, then the pages themselves.
pub fn region(pages: usize) -> (usize, usize) {
    assert!(pages < PAGE_SIZE);
    let size = (pages + 1) * PAGE_SIZE;
    let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
    let start = unsafe { alloc_zeroed(layout) };
    assert!(!start.is_null());
    (start as usize, size)
}

pub fn stack_pool() -> &'static mut StackPool {
    Box::leak(Box::new(StackPool::new()))
}

/// A kernel over a fresh `pages`-page region.
pub fn kernel(pages: usize) -> Kernel {
    let (start, size) = region(pages);
    unsafe { Kernel::new(start, size, stack_pool(), TaskAbi::default()).unwrap() }
}
