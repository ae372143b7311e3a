//! # Heap Allocator
//!
//! A first-fit, boundary-tag byte allocator layered on the page allocator.
//! It backs kernel object allocation (task contexts) and the `malloc`/`free`
//! API handed to tasks.
//!
//! ## Arena Layout
//!
//! The arena is a list of [`Segment`]s, each a run of pages obtained from
//! [`PageAllocator`]. The last segment is open: it holds a sequence of
//! bounded blocks followed by an unbounded free tail.
//!
//! ```text
//!  start                                         brk                 end
//!  │[T|payload|T][T|payload.......|T][T|pl|T]... │[0|  free tail  ]  │
//!     block 0         block 1         block 2      size 0 = unbounded
//! ```
//!
//! Every bounded block carries a leading and a trailing [`Tag`] that agree on
//! the block size (tags included). The record at `brk` reads `size == 0`,
//! meaning "extent not yet bounded, assume free". When the tail cannot hold a
//! request the open segment grows by whole pages claimed directly after its
//! end. If those pages are taken, the open segment is sealed (its tail
//! becomes an ordinary free block) and a new segment is opened wherever the
//! page allocator has room.
//!
//! ## Coalescing
//!
//! `free` inspects the trailing tag of the predecessor and the leading tag of
//! the successor and merges with whichever is free, so no two adjacent free
//! blocks ever survive a `free`. Merging never crosses a segment edge. A free
//! block that reaches `brk` is folded back into the unbounded tail.

use core::iter::FusedIterator;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::config::{HEAP_ALIGN, MAX_HEAP_SEGMENTS, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::page::PageAllocator;

/// Boundary-tag record. Sizes are 32 bits wide; the arena never approaches
/// 4 GiB on this target.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag {
    size: u32,
    used: u32,
}

impl Tag {
    const UNBOUNDED: Tag = Tag { size: 0, used: 0 };

    const fn new(size: usize, used: bool) -> Self {
        Tag {
            size: size as u32,
            used: used as u32,
        }
    }

    fn is_used(self) -> bool {
        self.used != 0
    }

    fn size(self) -> usize {
        self.size as usize
    }
}

/// Bytes of bookkeeping at each edge of a block.
pub const TAG_SIZE: usize = size_of::<Tag>();

/// Smallest block worth splitting off: two tags and one aligned word.
const MIN_BLOCK: usize = 2 * TAG_SIZE + HEAP_ALIGN;

static_assertions::const_assert_eq!(TAG_SIZE % HEAP_ALIGN, 0);
static_assertions::const_assert_eq!(PAGE_SIZE % HEAP_ALIGN, 0);

/// Total block size (tags included) for a `payload`-byte request.
fn block_size(payload: usize) -> Result<usize> {
    let size = payload
        .checked_add(HEAP_ALIGN - 1 + 2 * TAG_SIZE)
        .map(|n| n & !(HEAP_ALIGN - 1))
        .ok_or(KernelError::OutOfMemory)?;
    if size > u32::MAX as usize {
        return Err(KernelError::OutOfMemory);
    }
    Ok(size)
}

/// A bounded block as seen through its leading tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Address of the leading tag.
    pub addr: usize,
    /// Whole block size, both tags included.
    pub size: usize,
    pub used: bool,
}

impl Block {
    pub fn payload(&self) -> usize {
        self.addr + TAG_SIZE
    }

    pub fn capacity(&self) -> usize {
        self.size - 2 * TAG_SIZE
    }

    fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// A page run owned by the arena, `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

impl Segment {
    const EMPTY: Segment = Segment { start: 0, end: 0 };

    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes of page memory owned by the arena.
    pub arena: usize,
    /// Bytes in used blocks, tags included.
    pub used: usize,
    /// Bytes in free blocks plus the unbounded tail.
    pub free: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub segments: usize,
}

pub struct Heap {
    pages: PageAllocator,
    segments: [Segment; MAX_HEAP_SEGMENTS],
    /// Segments in use; the last one is open.
    count: usize,
    /// Start of the open segment's unbounded tail.
    brk: usize,
}

impl Heap {
    /// An empty heap; the arena is claimed from `pages` on first use.
    pub fn new(pages: PageAllocator) -> Self {
        Self {
            pages,
            segments: [Segment::EMPTY; MAX_HEAP_SEGMENTS],
            count: 0,
            brk: 0,
        }
    }

    /// Allocate `size` bytes, returning a `HEAP_ALIGN`-aligned payload.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(KernelError::InvalidArgument("zero-sized allocation"));
        }
        let need = block_size(size)?;

        let addr = match self.blocks().find(|b| !b.used && b.size >= need) {
            Some(block) => self.claim(block, need),
            None => self.carve_tail(need)?,
        };

        NonNull::new((addr + TAG_SIZE) as *mut u8).ok_or(KernelError::OutOfMemory)
    }

    /// Release a payload previously returned by [`Heap::malloc`].
    ///
    /// Pointers that are not the payload of a live block are rejected
    /// without modifying the arena.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let payload = ptr.as_ptr() as usize;
        let invalid = KernelError::InvalidAddress(payload);
        let block = payload
            .checked_sub(TAG_SIZE)
            .and_then(|addr| self.blocks().find(|b| b.addr == addr))
            .filter(|b| b.used)
            .ok_or(invalid)?;
        let index = self.segment_index(block.addr).ok_or(invalid)?;
        let first = self.segments[index].start;
        let limit = self.limit(index);

        let prev_free = (block.addr > first)
            .then(|| self.read_tag(block.addr - TAG_SIZE))
            .filter(|tag| !tag.is_used())
            .map(Tag::size);
        let next_free = (block.end() < limit)
            .then(|| self.read_tag(block.end()))
            .filter(|tag| !tag.is_used())
            .map(Tag::size);

        let mut start = block.addr;
        let mut size = block.size;
        match (prev_free, next_free) {
            (None, None) => {}
            (None, Some(next)) => {
                self.clear_tag(block.end() - TAG_SIZE);
                self.clear_tag(block.end());
                size += next;
            }
            (Some(prev), None) => {
                self.clear_tag(block.addr - TAG_SIZE);
                self.clear_tag(block.addr);
                start -= prev;
                size += prev;
            }
            (Some(prev), Some(next)) => {
                self.clear_tag(block.addr - TAG_SIZE);
                self.clear_tag(block.addr);
                self.clear_tag(block.end() - TAG_SIZE);
                self.clear_tag(block.end());
                start -= prev;
                size += prev + next;
            }
        }

        if index + 1 == self.count && start + size == self.brk {
            self.clear_tag(start + size - TAG_SIZE);
            self.brk = start;
            self.mark_tail();
        } else {
            self.write_block(start, size, false);
        }
        Ok(())
    }

    /// Move `value` into a fresh heap block.
    pub fn alloc_object<T>(&mut self, value: T) -> Result<NonNull<T>> {
        if align_of::<T>() > HEAP_ALIGN {
            return Err(KernelError::InvalidArgument("over-aligned heap object"));
        }
        let ptr = self.malloc(size_of::<T>().max(1))?.cast::<T>();
        // Safety: the block is fresh, large enough and suitably aligned.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Drop and release an object created by [`Heap::alloc_object`].
    ///
    /// # Safety
    /// `obj` must come from `alloc_object` on this heap and must not be used
    /// afterwards.
    pub unsafe fn free_object<T>(&mut self, obj: NonNull<T>) -> Result<()> {
        ptr::drop_in_place(obj.as_ptr());
        self.free(obj.cast())
    }

    /// Bounded blocks in address order within each segment, segments in the
    /// order they were opened.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            segment: 0,
            cursor: self.segments().first().map_or(0, |seg| seg.start),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena: self.segments().iter().map(Segment::len).sum(),
            free: self.open().map_or(0, |seg| seg.end - self.brk),
            segments: self.count,
            ..HeapStats::default()
        };
        for block in self.blocks() {
            stats.blocks += 1;
            if block.used {
                stats.used += block.size;
            } else {
                stats.free += block.size;
                stats.free_blocks += 1;
            }
        }
        stats
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments[..self.count]
    }

    /// Whether `addr` lies in a page owned by the arena.
    pub fn owns(&self, addr: usize) -> bool {
        self.segment_index(addr).is_some()
    }

    pub fn arena_start(&self) -> usize {
        self.segments().first().map_or(0, |seg| seg.start)
    }

    /// End of the last bounded block; start of the unbounded tail.
    pub fn brk(&self) -> usize {
        self.brk
    }

    /// End of the open segment.
    pub fn high_water(&self) -> usize {
        self.open().map_or(0, |seg| seg.end)
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut PageAllocator {
        &mut self.pages
    }

    fn open(&self) -> Option<Segment> {
        self.segments().last().copied()
    }

    fn segment_index(&self, addr: usize) -> Option<usize> {
        self.segments().iter().position(|seg| seg.contains(addr))
    }

    /// End of the bounded blocks in segment `index`.
    fn limit(&self, index: usize) -> usize {
        if index + 1 == self.count {
            self.brk
        } else {
            self.segments[index].end
        }
    }

    /// Mark a free block used, splitting off the remainder when it can hold
    /// a block of its own.
    fn claim(&mut self, block: Block, need: usize) -> usize {
        let rest = block.size - need;
        if rest >= MIN_BLOCK {
            self.write_block(block.addr, need, true);
            self.write_block(block.addr + need, rest, false);
        } else {
            self.write_block(block.addr, block.size, true);
        }
        block.addr
    }

    fn carve_tail(&mut self, need: usize) -> Result<usize> {
        let room = self.open().map_or(0, |seg| seg.end - self.brk);
        if room < need {
            self.grow(need, room)?;
        }
        let addr = self.brk;
        self.write_block(addr, need, true);
        self.brk += need;
        self.mark_tail();
        Ok(addr)
    }

    /// Make room for a `need`-byte block at `brk`, `room` bytes being
    /// already available there.
    fn grow(&mut self, need: usize, room: usize) -> Result<()> {
        if let Some(open) = self.open() {
            let npages = (need - room).div_ceil(PAGE_SIZE);
            if self.pages.alloc_at(open.end, npages).is_ok() {
                self.segments[self.count - 1].end += npages * PAGE_SIZE;
                log::debug!(
                    "heap: grew by {} page(s), segment {:#x}..{:#x}",
                    npages,
                    open.start,
                    open.end + npages * PAGE_SIZE
                );
                return Ok(());
            }
        }

        if self.count == MAX_HEAP_SEGMENTS {
            log::warn!("heap: all {} segments in use", MAX_HEAP_SEGMENTS);
            return Err(KernelError::OutOfMemory);
        }
        let npages = need.div_ceil(PAGE_SIZE);
        let base = self.pages.alloc(npages)?;
        self.seal();
        let segment = Segment {
            start: base,
            end: base + npages * PAGE_SIZE,
        };
        self.segments[self.count] = segment;
        self.count += 1;
        self.brk = base;
        log::debug!(
            "heap: opened segment {} at {:#x}..{:#x}",
            self.count - 1,
            segment.start,
            segment.end
        );
        Ok(())
    }

    /// Bound the open segment's tail so a new segment can be opened.
    fn seal(&mut self) {
        let Some(open) = self.open() else {
            return;
        };
        let tail = open.end - self.brk;
        if tail >= 2 * TAG_SIZE {
            self.write_block(self.brk, tail, false);
        } else if tail == TAG_SIZE {
            // Too narrow for a tag pair: the block before it absorbs it. That
            // block is used, a free one would have been folded into the tail.
            let last = self.read_tag(self.brk - TAG_SIZE);
            self.write_block(self.brk - last.size(), last.size() + tail, last.is_used());
        }
        self.brk = open.end;
    }

    fn mark_tail(&mut self) {
        if self.high_water() - self.brk >= TAG_SIZE {
            self.write_tag(self.brk, Tag::UNBOUNDED);
        }
    }

    fn write_block(&mut self, addr: usize, size: usize, used: bool) {
        let tag = Tag::new(size, used);
        self.write_tag(addr, tag);
        self.write_tag(addr + size - TAG_SIZE, tag);
    }

    fn clear_tag(&mut self, addr: usize) {
        self.write_tag(addr, Tag::UNBOUNDED);
    }

    /// Callers only pass addresses derived from blocks of a known segment.
    fn tag_ptr(&self, addr: usize) -> *mut Tag {
        debug_assert!(
            addr % HEAP_ALIGN == 0
                && self
                    .segments()
                    .iter()
                    .any(|seg| addr >= seg.start && addr + TAG_SIZE <= seg.end),
            "heap: tag {:#x} outside arena",
            addr
        );
        addr as *mut Tag
    }

    fn read_tag(&self, addr: usize) -> Tag {
        // Safety: tags are only read inside segment pages this heap owns.
        unsafe { self.tag_ptr(addr).read() }
    }

    fn write_tag(&mut self, addr: usize, tag: Tag) {
        // Safety: tags are only written inside segment pages this heap owns.
        unsafe { self.tag_ptr(addr).write(tag) }
    }
}

pub struct Blocks<'a> {
    heap: &'a Heap,
    segment: usize,
    cursor: usize,
}

impl Iterator for Blocks<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        while self.segment < self.heap.count {
            if self.cursor < self.heap.limit(self.segment) {
                let tag = self.heap.read_tag(self.cursor);
                if tag.size() != 0 {
                    let block = Block {
                        addr: self.cursor,
                        size: tag.size(),
                        used: tag.is_used(),
                    };
                    self.cursor += block.size;
                    return Some(block);
                }
            }
            self.segment += 1;
            if let Some(seg) = self.heap.segments().get(self.segment) {
                self.cursor = seg.start;
            }
        }
        None
    }
}

impl FusedIterator for Blocks<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::region;

    fn heap(pages: usize) -> Heap {
        let (start, size) = region(pages);
        Heap::new(unsafe { PageAllocator::new(start, size).unwrap() })
    }

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    fn block_at(heap: &Heap, payload: NonNull<u8>) -> Block {
        heap.blocks()
            .find(|b| b.payload() == addr(payload))
            .expect("no block at payload")
    }

    /// Leading and trailing tags agree, blocks tile every segment and no two
    /// free blocks touch.
    fn assert_well_formed(heap: &Heap) {
        let mut blocks = heap.blocks();
        let segments = heap.segments();
        for (i, seg) in segments.iter().enumerate() {
            let open = i + 1 == segments.len();
            let limit = if open { heap.brk() } else { seg.end };
            let mut prev_free = false;
            let mut cursor = seg.start;
            while cursor < limit {
                let block = blocks.next().expect("segment not tiled by blocks");
                assert_eq!(block.addr, cursor);
                assert_eq!(heap.read_tag(block.end() - TAG_SIZE), Tag::new(block.size, block.used));
                assert!(!(prev_free && !block.used), "adjacent free blocks at {:#x}", block.addr);
                prev_free = !block.used;
                cursor = block.end();
            }
            assert_eq!(cursor, limit);
            if open {
                // A free block may not run into the unbounded tail either.
                assert!(!prev_free, "free block before the tail");
            }
        }
        assert_eq!(blocks.next(), None);
    }

    const BLOCK_32: usize = 32 + 2 * TAG_SIZE;

    #[test]
    fn test_payloads_are_contiguous_and_aligned() {
        let mut heap = heap(4);
        let x = heap.malloc(32).unwrap();
        let y = heap.malloc(32).unwrap();
        let z = heap.malloc(5).unwrap();

        assert_eq!(addr(x) % HEAP_ALIGN, 0);
        assert_eq!(addr(y), addr(x) + BLOCK_32);
        assert_eq!(addr(z), addr(y) + BLOCK_32);
        assert_eq!(block_at(&heap, z).capacity(), 8);
        assert_eq!(heap.arena_start(), heap.pages().alloc_start());
        assert_well_formed(&heap);
    }

    #[test]
    fn test_zero_sized_request_rejected() {
        let mut heap = heap(2);
        assert_eq!(
            heap.malloc(0),
            Err(KernelError::InvalidArgument("zero-sized allocation"))
        );
    }

    #[test]
    fn test_free_isolated_block() {
        let mut heap = heap(2);
        let x = heap.malloc(32).unwrap();
        let y = heap.malloc(32).unwrap();
        let _z = heap.malloc(32).unwrap();

        heap.free(y).unwrap();
        let freed = block_at(&heap, y);
        assert!(!freed.used);
        assert_eq!(freed.size, BLOCK_32);
        assert!(block_at(&heap, x).used);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_free_merges_with_next() {
        let mut heap = heap(2);
        let _x = heap.malloc(32).unwrap();
        let y = heap.malloc(32).unwrap();
        let z = heap.malloc(32).unwrap();
        let _w = heap.malloc(32).unwrap();

        heap.free(z).unwrap();
        heap.free(y).unwrap();
        let merged = block_at(&heap, y);
        assert!(!merged.used);
        assert_eq!(merged.size, 2 * BLOCK_32);
        assert_eq!(heap.stats().free_blocks, 1);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_free_merges_with_previous() {
        let mut heap = heap(2);
        let x = heap.malloc(32).unwrap();
        let y = heap.malloc(32).unwrap();
        let _z = heap.malloc(32).unwrap();

        heap.free(x).unwrap();
        heap.free(y).unwrap();
        let merged = block_at(&heap, x);
        assert_eq!(merged.size, 2 * BLOCK_32);
        assert_eq!(heap.stats().free_blocks, 1);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        let mut heap = heap(2);
        let x = heap.malloc(32).unwrap();
        let y = heap.malloc(32).unwrap();
        let z = heap.malloc(32).unwrap();
        let _w = heap.malloc(32).unwrap();

        heap.free(y).unwrap();
        heap.free(x).unwrap();
        heap.free(z).unwrap();

        let merged = block_at(&heap, x);
        assert!(!merged.used);
        assert_eq!(merged.size, 3 * BLOCK_32);
        // Three blocks' worth of space, minus the one tag pair still needed.
        assert_eq!(merged.capacity(), 3 * BLOCK_32 - 2 * TAG_SIZE);
        assert_eq!(heap.stats().free_blocks, 1);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_free_at_end_returns_to_tail() {
        let mut heap = heap(2);
        let x = heap.malloc(32).unwrap();
        let y = heap.malloc(32).unwrap();
        let before = heap.brk();

        heap.free(y).unwrap();
        assert_eq!(heap.brk(), before - BLOCK_32);
        heap.free(x).unwrap();
        assert_eq!(heap.brk(), heap.arena_start());
        assert_eq!(heap.read_tag(heap.brk()), Tag::UNBOUNDED);
        assert_eq!(heap.blocks().count(), 0);
    }

    #[test]
    fn test_freed_run_at_end_is_reused_whole() {
        let mut heap = heap(2);
        let x = heap.malloc(32).unwrap();
        let y = heap.malloc(32).unwrap();
        let z = heap.malloc(32).unwrap();

        heap.free(y).unwrap();
        heap.free(x).unwrap();
        heap.free(z).unwrap();
        assert_eq!(heap.brk(), heap.arena_start());
        assert_eq!(heap.blocks().count(), 0);

        // The three blocks' span, less one tag pair, comes back as one payload.
        let merged = heap.malloc(3 * BLOCK_32 - 2 * TAG_SIZE).unwrap();
        assert_eq!(merged, x);
        assert_eq!(block_at(&heap, merged).size, 3 * BLOCK_32);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_first_fit_reuses_freed_block() {
        let mut heap = heap(2);
        let _a = heap.malloc(32).unwrap();
        let b = heap.malloc(32).unwrap();
        let _c = heap.malloc(32).unwrap();

        heap.free(b).unwrap();
        assert_eq!(heap.malloc(32), Ok(b));

        heap.free(b).unwrap();
        // Smaller request splits the hole; the remainder stays free.
        assert_eq!(heap.malloc(8), Ok(b));
        let rest = heap.blocks().find(|blk| blk.addr == addr(b) - TAG_SIZE + 8 + 2 * TAG_SIZE);
        assert_eq!(
            rest,
            Some(Block {
                addr: addr(b) - TAG_SIZE + 8 + 2 * TAG_SIZE,
                size: BLOCK_32 - (8 + 2 * TAG_SIZE),
                used: false,
            })
        );
        assert_well_formed(&heap);
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let mut heap = heap(2);
        let a = heap.malloc(24).unwrap();
        let _guard = heap.malloc(8).unwrap();
        heap.free(a).unwrap();

        // 24 + tags leaves 8 bytes over a 16-byte request: too small to split.
        assert_eq!(heap.malloc(16), Ok(a));
        assert_eq!(block_at(&heap, a).size, 24 + 2 * TAG_SIZE);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_conservation_over_mixed_sequence() {
        let mut heap = heap(8);
        let sizes = [32, 100, 8, 512, 64, 3000, 16, 200, 40, 1];
        let mut live: Vec<NonNull<u8>> = sizes.iter().map(|&n| heap.malloc(n).unwrap()).collect();
        let arena = heap.stats().arena;
        assert!(arena > 0);

        // Free in a scrambled but deterministic order.
        let mut k = 3;
        while !live.is_empty() {
            k = (k * 7 + 1) % live.len().max(1);
            let ptr = live.swap_remove(k % live.len());
            heap.free(ptr).unwrap();
            assert_well_formed(&heap);
        }

        let stats = heap.stats();
        assert_eq!(stats.arena, arena);
        assert_eq!(stats.free, arena);
        assert_eq!(stats.used, 0);
        assert_eq!(stats.blocks, 0);
    }

    #[test]
    fn test_grows_by_whole_contiguous_pages() {
        let mut heap = heap(8);
        let full = heap.malloc(PAGE_SIZE - 2 * TAG_SIZE).unwrap();
        assert_eq!(heap.stats().arena, PAGE_SIZE);
        assert_eq!(heap.pages().free_pages(), 7);

        let next = heap.malloc(8).unwrap();
        assert_eq!(addr(next), addr(full) + PAGE_SIZE);
        assert_eq!(heap.stats().arena, 2 * PAGE_SIZE);

        let big = heap.malloc(2 * PAGE_SIZE).unwrap();
        assert!(addr(big) > addr(next));
        // Only the shortfall beyond the remaining tail is requested.
        assert_eq!(heap.stats().arena, 4 * PAGE_SIZE);
        assert_eq!(heap.pages().free_pages(), 4);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = heap(2);
        assert_eq!(heap.malloc(3 * PAGE_SIZE), Err(KernelError::OutOfMemory));
        // A failed request leaves the heap usable.
        assert!(heap.malloc(64).is_ok());
    }

    #[test]
    fn test_growth_opens_new_segment_when_next_page_taken() {
        let mut heap = heap(4);
        let full = heap.malloc(PAGE_SIZE - 2 * TAG_SIZE).unwrap();
        // Someone else takes the page right after the arena.
        let blocker = heap.pages_mut().alloc(1).unwrap();
        assert_eq!(blocker, heap.high_water());

        let next = heap.malloc(8).unwrap();
        assert_eq!(heap.segments().len(), 2);
        assert!(!heap.owns(blocker));
        assert!(heap.owns(addr(full)) && heap.owns(addr(next)));
        assert_eq!(heap.arena_start(), addr(full) - TAG_SIZE);
        assert_eq!(heap.stats().arena, 2 * PAGE_SIZE);
        assert_eq!(heap.pages().free_pages(), 1);
        assert_well_formed(&heap);

        // The last free page still extends the open segment; beyond it there
        // is nothing left to claim.
        assert_eq!(heap.malloc(2 * PAGE_SIZE), Err(KernelError::OutOfMemory));
        assert_eq!(heap.segments().len(), 2);
        assert!(heap.malloc(64).is_ok());
    }

    #[test]
    fn test_sealed_tail_stays_allocatable() {
        let mut heap = heap(4);
        let a = heap.malloc(64).unwrap();
        heap.pages_mut().alloc(1).unwrap();
        let big = heap.malloc(PAGE_SIZE - 2 * TAG_SIZE).unwrap();
        assert_eq!(heap.segments().len(), 2);

        // The first segment's tail became a free block and is found first.
        let small = heap.malloc(128).unwrap();
        assert_eq!(addr(small), addr(a) + 64 + 2 * TAG_SIZE);
        assert!(heap.segments()[0].contains(addr(small)));
        assert_well_formed(&heap);

        for ptr in [a, big, small] {
            heap.free(ptr).unwrap();
            assert_well_formed(&heap);
        }
        let stats = heap.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free, stats.arena);
    }

    #[test]
    fn test_narrow_tail_is_absorbed_on_seal() {
        let mut heap = heap(4);
        // Leaves exactly one tag's worth at the end of the first page.
        let a = heap.malloc(PAGE_SIZE - 3 * TAG_SIZE).unwrap();
        assert_eq!(heap.high_water() - heap.brk(), TAG_SIZE);
        heap.pages_mut().alloc(1).unwrap();

        heap.malloc(32).unwrap();
        assert_eq!(heap.segments().len(), 2);
        assert_eq!(block_at(&heap, a).size, PAGE_SIZE);
        assert_well_formed(&heap);
    }

    #[test]
    fn test_free_every_order_across_segments() {
        let orders = (0..4usize.pow(4)).filter_map(|n| {
            let order = [n % 4, n / 4 % 4, n / 16 % 4, n / 64];
            let distinct = (0..4).all(|i| order.contains(&i));
            distinct.then_some(order)
        });
        for order in orders {
            let mut heap = heap(6);
            let x = heap.malloc(1000).unwrap();
            let y = heap.malloc(2000).unwrap();
            heap.pages_mut().alloc(1).unwrap();
            let z = heap.malloc(3000).unwrap();
            let w = heap.malloc(500).unwrap();
            assert_eq!(heap.segments().len(), 2, "order {:?}", order);
            let ptrs = [x, y, z, w];

            for i in order {
                heap.free(ptrs[i]).unwrap();
                assert_well_formed(&heap);
            }
            let stats = heap.stats();
            assert_eq!(stats.used, 0, "order {:?}", order);
            assert_eq!(stats.free, stats.arena, "order {:?}", order);
        }
    }

    #[test]
    fn test_free_rejects_foreign_and_double_free() {
        let mut heap = heap(2);
        let x = heap.malloc(32).unwrap();
        let _y = heap.malloc(32).unwrap();

        let interior = NonNull::new((addr(x) + 8) as *mut u8).unwrap();
        assert_eq!(heap.free(interior), Err(KernelError::InvalidAddress(addr(x) + 8)));

        let mut outside = 0u64;
        let outside = NonNull::from(&mut outside).cast::<u8>();
        assert!(heap.free(outside).is_err());

        heap.free(x).unwrap();
        assert_eq!(heap.free(x), Err(KernelError::InvalidAddress(addr(x))));
        assert_well_formed(&heap);
    }

    #[test]
    fn test_objects() {
        #[derive(Debug, PartialEq)]
        struct Pair {
            a: u32,
            b: u64,
        }

        let mut heap = heap(2);
        let obj = heap.alloc_object(Pair { a: 1, b: 2 }).unwrap();
        assert_eq!(unsafe { obj.as_ref() }, &Pair { a: 1, b: 2 });
        assert_eq!(heap.stats().used, size_of::<Pair>() + 2 * TAG_SIZE);

        unsafe { heap.free_object(obj).unwrap() };
        assert_eq!(heap.stats().used, 0);
    }
}
