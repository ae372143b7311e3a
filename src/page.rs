//! # Page Allocator
//!
//! Hands out runs of contiguous physical pages from the reserved heap region.
//!
//! The region is self-describing: its first bytes hold one [`PageFlags`]
//! descriptor per allocatable page, and the page-aligned range after the
//! descriptors is what gets handed out.
//!
//! ```text
//!  region_start                 alloc_start                        alloc_end
//!  │ descriptors (1 byte/page) │pad│ page 0 │ page 1 │ ... │ page n-1 │
//! ```
//!
//! A multi-page allocation has `TAKEN` set on every page of the run and `LAST`
//! only on its final page, which is how [`PageAllocator::free`] knows where a
//! run ends.

use bitflags::bitflags;
use core::slice;

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};

bitflags! {
    /// Page descriptor.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The page belongs to a live allocation.
        const TAKEN = 1 << 0;
        /// The page is the final page of its allocation.
        const LAST = 1 << 1;
    }
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub struct PageAllocator {
    descriptors: &'static mut [PageFlags],
    alloc_start: usize,
}

impl PageAllocator {
    /// Build an allocator over `[region_start, region_start + region_size)`.
    ///
    /// # Safety
    /// The region must be valid, writable, unused by anything else, and must
    /// outlive the allocator.
    pub unsafe fn new(region_start: usize, region_size: usize) -> Result<Self> {
        let region_end = region_start
            .checked_add(region_size)
            .ok_or(KernelError::InvalidArgument("page region wraps the address space"))?;

        // Largest page count whose descriptors and pages both fit.
        let mut num_pages = region_size / (PAGE_SIZE + 1);
        let alloc_start = loop {
            if num_pages == 0 {
                return Err(KernelError::OutOfMemory);
            }
            let start = align_up(region_start + num_pages, PAGE_SIZE);
            if start + num_pages * PAGE_SIZE <= region_end {
                break start;
            }
            num_pages -= 1;
        };

        let base = region_start as *mut PageFlags;
        core::ptr::write_bytes(base, 0, num_pages);
        let descriptors = slice::from_raw_parts_mut(base, num_pages);

        log::debug!(
            "page allocator: {} pages at {:#x}..{:#x}",
            num_pages,
            alloc_start,
            alloc_start + num_pages * PAGE_SIZE
        );

        Ok(Self {
            descriptors,
            alloc_start,
        })
    }

    /// Allocate `npages` contiguous pages, returning the address of the first.
    pub fn alloc(&mut self, npages: usize) -> Result<usize> {
        if npages == 0 {
            return Err(KernelError::InvalidArgument("zero-page allocation"));
        }
        let total = self.num_pages();
        if npages > total {
            log::warn!("page_alloc({}) exceeds the {} managed pages", npages, total);
            return Err(KernelError::OutOfMemory);
        }

        let mut i = 0;
        while i + npages <= total {
            match self.last_taken(i, npages) {
                // Restart the search just past the page that broke the run.
                Some(taken) => i = taken + 1,
                None => {
                    self.mark(i, npages);
                    return Ok(self.page_address(i));
                }
            }
        }

        log::warn!("page_alloc({}) found no free run", npages);
        Err(KernelError::OutOfMemory)
    }

    /// Claim the specific run of `npages` starting at `addr`.
    ///
    /// Fails with `OutOfMemory` when any page of the run is taken or the run
    /// leaves the managed range.
    pub fn alloc_at(&mut self, addr: usize, npages: usize) -> Result<usize> {
        if npages == 0 {
            return Err(KernelError::InvalidArgument("zero-page allocation"));
        }
        let index = self.page_index(addr).ok_or(KernelError::InvalidAddress(addr))?;
        if index + npages > self.num_pages() || self.last_taken(index, npages).is_some() {
            return Err(KernelError::OutOfMemory);
        }
        self.mark(index, npages);
        Ok(addr)
    }

    /// Release the allocation starting at `addr`, returning its page count.
    ///
    /// Null, out-of-range, unaligned, free and interior addresses are rejected
    /// without touching any descriptor.
    pub fn free(&mut self, addr: usize) -> Result<usize> {
        let index = self.page_index(addr).ok_or(KernelError::InvalidAddress(addr))?;
        if !self.descriptors[index].contains(PageFlags::TAKEN) {
            return Err(KernelError::InvalidAddress(addr));
        }
        // A taken predecessor without LAST means `addr` is inside its run.
        if index > 0 {
            let prev = self.descriptors[index - 1];
            if prev.contains(PageFlags::TAKEN) && !prev.contains(PageFlags::LAST) {
                return Err(KernelError::InvalidAddress(addr));
            }
        }

        let mut freed = 0;
        for flags in &mut self.descriptors[index..] {
            if !flags.contains(PageFlags::TAKEN) {
                break;
            }
            let last = flags.contains(PageFlags::LAST);
            *flags = PageFlags::empty();
            freed += 1;
            if last {
                break;
            }
        }
        Ok(freed)
    }

    pub fn num_pages(&self) -> usize {
        self.descriptors.len()
    }

    pub fn free_pages(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|flags| !flags.contains(PageFlags::TAKEN))
            .count()
    }

    pub fn is_taken(&self, index: usize) -> bool {
        self.descriptors
            .get(index)
            .is_some_and(|flags| flags.contains(PageFlags::TAKEN))
    }

    pub fn is_last(&self, index: usize) -> bool {
        self.descriptors
            .get(index)
            .is_some_and(|flags| flags.contains(PageFlags::LAST))
    }

    pub fn alloc_start(&self) -> usize {
        self.alloc_start
    }

    pub fn alloc_end(&self) -> usize {
        self.alloc_start + self.num_pages() * PAGE_SIZE
    }

    /// Index of the page starting exactly at `addr`.
    pub fn page_index(&self, addr: usize) -> Option<usize> {
        if addr == 0 || addr < self.alloc_start || addr >= self.alloc_end() {
            return None;
        }
        let offset = addr - self.alloc_start;
        (offset % PAGE_SIZE == 0).then_some(offset / PAGE_SIZE)
    }

    #[inline]
    fn page_address(&self, index: usize) -> usize {
        self.alloc_start + index * PAGE_SIZE
    }

    /// Last taken page in `[start, start + npages)`, if any.
    fn last_taken(&self, start: usize, npages: usize) -> Option<usize> {
        (start..start + npages)
            .rev()
            .find(|&i| self.descriptors[i].contains(PageFlags::TAKEN))
    }

    fn mark(&mut self, start: usize, npages: usize) {
        for flags in &mut self.descriptors[start..start + npages] {
            *flags = PageFlags::TAKEN;
        }
        self.descriptors[start + npages - 1].insert(PageFlags::LAST);
    }
}
