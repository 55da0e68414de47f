//! The kernel heap.
//!
//! First-fit free-list allocator over a growable virtual range starting at
//! `HEAP_START`. Each block is a header followed by its payload; the block
//! chain exactly covers `[heap_start, heap_end)`. The heap grows itself in
//! frame-sized increments by mapping fresh physical frames contiguously
//! past `heap_end`, and never shrinks. A `GlobalAlloc` wrapper makes it the
//! allocator behind `alloc::boxed::Box` and friends.

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr::{self, NonNull};

use spin::{Mutex, MutexGuard};
use x86_64::{align_up, structures::paging::PageTableFlags, VirtAddr};

use crate::constants::memory::{FRAME_SIZE, HEAP_ALIGN, HEAP_SPLIT_SLACK, HEAP_START};
use crate::memory::{frame_allocator::alloc_frame, paging, MemoryError};

#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Header stored immediately before every payload. `size` is the payload
/// size in bytes, always a multiple of 8.
#[repr(C)]
struct BlockHeader {
    size: usize,
    free: bool,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

pub struct KernelHeap {
    head: *mut BlockHeader,
    heap_start: u64,
    heap_end: u64,
}

// Raw block pointers all point into the kernel's own heap range.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    pub const fn empty() -> Self {
        KernelHeap {
            head: ptr::null_mut(),
            heap_start: HEAP_START,
            heap_end: HEAP_START,
        }
    }

    /// Allocates `size` bytes, 8-byte aligned. `None` for a zero-size
    /// request or on exhaustion. The returned memory is not zeroed.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let needed = align_up(size as u64, HEAP_ALIGN as u64) as usize;

        let mut current = self.head;
        while !current.is_null() {
            unsafe {
                if (*current).free && (*current).size >= needed {
                    return Some(self.take_block(current, needed));
                }
                current = (*current).next;
            }
        }

        // no block fits: grow and retry once against the new tail node
        let tail = self.grow(needed).ok()?;
        unsafe { Some(self.take_block(tail, needed)) }
    }

    /// Marks the block owning `ptr` free, then coalesces the whole chain.
    /// `ptr` must come from a still-live prior `allocate`; nothing is
    /// validated.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let block = ptr.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
            (*block).free = true;
        }
        self.coalesce();
    }

    /// Allocates `size` bytes at a multiple of `alignment` (forced to at
    /// least 8). Over-allocates and stashes the raw pointer one
    /// pointer-width below the aligned address for `free_aligned`.
    pub fn allocate_aligned(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let alignment = alignment.max(HEAP_ALIGN);
        let raw = self.allocate(size + alignment + mem::size_of::<usize>())?;
        let raw_addr = raw.as_ptr() as usize;
        let aligned =
            align_up((raw_addr + mem::size_of::<usize>()) as u64, alignment as u64) as usize;
        unsafe {
            *((aligned - mem::size_of::<usize>()) as *mut usize) = raw_addr;
            Some(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    /// Frees a pointer obtained from `allocate_aligned`.
    pub fn free_aligned(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let raw = *((ptr.as_ptr() as usize - mem::size_of::<usize>()) as *const usize);
            self.free(NonNull::new_unchecked(raw as *mut u8));
        }
    }

    /// Marks `block` allocated, splitting off the tail as a new free block
    /// when the leftover exceeds one header plus the slack minimum;
    /// otherwise the whole block is consumed (bounded internal
    /// fragmentation, accepted by design).
    unsafe fn take_block(&mut self, block: *mut BlockHeader, needed: usize) -> NonNull<u8> {
        if (*block).size > needed + HEADER_SIZE + HEAP_SPLIT_SLACK {
            let rest = (block as *mut u8).add(HEADER_SIZE + needed) as *mut BlockHeader;
            (*rest).size = (*block).size - needed - HEADER_SIZE;
            (*rest).free = true;
            (*rest).next = (*block).next;
            (*block).size = needed;
            (*block).next = rest;
        }
        (*block).free = false;
        NonNull::new_unchecked((block as *mut u8).add(HEADER_SIZE))
    }

    /// Maps enough fresh frames past `heap_end` to hold `needed` payload
    /// bytes plus a header, and appends (or seeds) one free block covering
    /// them. Frames and mappings committed before a failure are not
    /// unwound.
    fn grow(&mut self, needed: usize) -> Result<*mut BlockHeader, MemoryError> {
        let bytes = align_up((needed + HEADER_SIZE) as u64, FRAME_SIZE as u64);
        let base = self.heap_end;

        let mut end = base;
        while end < base + bytes {
            let frame = alloc_frame().ok_or(MemoryError::FrameExhaustion)?;
            paging::map_page(
                VirtAddr::new(end),
                frame.start_address(),
                PageTableFlags::WRITABLE,
            )?;
            end += FRAME_SIZE as u64;
        }
        self.heap_end = end;

        let node = base as *mut BlockHeader;
        unsafe {
            (*node).size = (end - base) as usize - HEADER_SIZE;
            (*node).free = true;
            (*node).next = ptr::null_mut();
        }

        if self.head.is_null() {
            self.head = node;
        } else {
            let mut tail = self.head;
            unsafe {
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = node;
            }
        }
        Ok(node)
    }

    /// One linear pass over the entire chain, merging every pair of
    /// address-adjacent free blocks. No early exit.
    fn coalesce(&mut self) {
        let mut current = self.head;
        while !current.is_null() {
            unsafe {
                let next = (*current).next;
                if !next.is_null()
                    && (*current).free
                    && (*next).free
                    && (current as *mut u8).add(HEADER_SIZE + (*current).size) == next as *mut u8
                {
                    (*current).size += HEADER_SIZE + (*next).size;
                    (*current).next = (*next).next;
                    // stay put, the merged block may absorb another
                } else {
                    current = next;
                }
            }
        }
    }

    pub fn heap_range(&self) -> (u64, u64) {
        (self.heap_start, self.heap_end)
    }

    /// Sum of free payload bytes across the chain.
    pub fn free_payload_bytes(&self) -> usize {
        let mut sum = 0;
        let mut current = self.head;
        while !current.is_null() {
            unsafe {
                if (*current).free {
                    sum += (*current).size;
                }
                current = (*current).next;
            }
        }
        sum
    }

    /// Sum of allocated payload bytes across the chain.
    pub fn used_payload_bytes(&self) -> usize {
        let mut sum = 0;
        let mut current = self.head;
        while !current.is_null() {
            unsafe {
                if !(*current).free {
                    sum += (*current).size;
                }
                current = (*current).next;
            }
        }
        sum
    }

    /// Number of blocks in the chain.
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while !current.is_null() {
            count += 1;
            current = unsafe { (*current).next };
        }
        count
    }

    /// Checks the covering invariant: headers plus payloads tile
    /// `[heap_start, heap_end)` exactly, no gaps, no overlaps.
    pub fn chain_is_consistent(&self) -> bool {
        let mut expected = self.heap_start;
        let mut current = self.head;
        while !current.is_null() {
            if current as u64 != expected {
                return false;
            }
            unsafe {
                expected = current as u64 + (HEADER_SIZE + (*current).size) as u64;
                current = (*current).next;
            }
        }
        expected == self.heap_end
    }
}

/// The heap behind a single lock; allocation, growth and the coalescing
/// pass all happen under it as one critical section.
pub struct LockedHeap(Mutex<KernelHeap>);

impl LockedHeap {
    pub const fn empty() -> Self {
        LockedHeap(Mutex::new(KernelHeap::empty()))
    }

    pub fn lock(&self) -> MutexGuard<'_, KernelHeap> {
        self.0.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.0.lock();
        let result = if layout.align() <= HEAP_ALIGN {
            heap.allocate(layout.size())
        } else {
            heap.allocate_aligned(layout.size(), layout.align())
        };
        result.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            let mut heap = self.0.lock();
            if layout.align() <= HEAP_ALIGN {
                heap.free(ptr);
            } else {
                heap.free_aligned(ptr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{boxed::Box, string::String, vec, vec::Vec};

    #[test_case]
    fn test_zero_size_allocation() {
        let mut heap = ALLOCATOR.lock();
        assert!(heap.allocate(0).is_none());
    }

    #[test_case]
    fn test_allocate_writes_do_not_clobber_neighbor() {
        let mut heap = ALLOCATOR.lock();
        let a = heap.allocate(64).expect("alloc failed");
        let b = heap.allocate(64).expect("alloc failed");

        unsafe {
            ptr::write_bytes(a.as_ptr(), 0xAA, 64);
            ptr::write_bytes(b.as_ptr(), 0x55, 64);
            assert_eq!(*a.as_ptr(), 0xAA);
            assert_eq!(*a.as_ptr().add(63), 0xAA);
            assert_eq!(*b.as_ptr(), 0x55);
        }

        heap.free(a);
        heap.free(b);
        assert!(heap.chain_is_consistent());
    }

    #[test_case]
    fn test_free_coalesces_whole_chain() {
        let mut heap = ALLOCATOR.lock();
        // warm the heap so the sequence below cannot trigger growth
        let warm = heap.allocate(2048).expect("alloc failed");
        heap.free(warm);

        let baseline_free = heap.free_payload_bytes();
        let baseline_blocks = heap.block_count();

        let ptrs: [NonNull<u8>; 4] = core::array::from_fn(|_| {
            heap.allocate(256).expect("alloc failed")
        });
        assert!(heap.free_payload_bytes() < baseline_free);

        // free in mixed order; the full-chain pass merges all neighbors
        for ptr in [ptrs[2], ptrs[0], ptrs[3], ptrs[1]] {
            heap.free(ptr);
        }

        assert_eq!(heap.free_payload_bytes(), baseline_free);
        assert_eq!(heap.block_count(), baseline_blocks);
        assert!(heap.chain_is_consistent());
    }

    /// Headers, free payloads and allocated payloads must add up to the
    /// exact heap extent at every point of an alloc/free sequence; once the
    /// sequence's blocks are all freed, the free payload alone accounts for
    /// everything the chain does not spend on headers or live allocations.
    fn accounting_holds(heap: &KernelHeap) -> bool {
        let (start, end) = heap.heap_range();
        heap.free_payload_bytes()
            == (end - start) as usize - heap.block_count() * HEADER_SIZE - heap.used_payload_bytes()
    }

    #[test_case]
    fn test_free_bytes_match_heap_extent() {
        let mut heap = ALLOCATOR.lock();

        let a = heap.allocate(40).expect("alloc failed");
        let b = heap.allocate(512).expect("alloc failed");
        let c = heap.allocate(96).expect("alloc failed");
        assert!(accounting_holds(&heap));

        heap.free(b);
        assert!(accounting_holds(&heap));

        let d = heap.allocate(64).expect("alloc failed");
        assert!(accounting_holds(&heap));

        for ptr in [d, a, c] {
            heap.free(ptr);
            assert!(accounting_holds(&heap));
        }
        assert!(heap.chain_is_consistent());
    }

    #[test_case]
    fn test_chain_covers_heap_range() {
        let mut heap = ALLOCATOR.lock();
        let a = heap.allocate(100).expect("alloc failed");
        let b = heap.allocate(3000).expect("alloc failed");
        assert!(heap.chain_is_consistent());

        // the region only ever grows in whole frames
        let (start, end) = heap.heap_range();
        assert!(end > start);
        assert_eq!((end - start) % FRAME_SIZE as u64, 0);
        heap.free(b);
        assert!(heap.chain_is_consistent());
        heap.free(a);
        assert!(heap.chain_is_consistent());
    }

    #[test_case]
    fn test_aligned_allocation() {
        let mut heap = ALLOCATOR.lock();
        // warm up so the measured sequence stays growth-free
        let warm = heap.allocate_aligned(512, 4096).expect("alloc failed");
        heap.free_aligned(warm);

        let baseline = heap.free_payload_bytes();
        for alignment in [8usize, 16, 64, 256, 4096] {
            let ptr = heap.allocate_aligned(512, alignment).expect("alloc failed");
            assert_eq!(ptr.as_ptr() as usize % alignment, 0);
            heap.free_aligned(ptr);
        }
        assert_eq!(heap.free_payload_bytes(), baseline);
    }

    #[test_case]
    fn test_small_alignment_forced_to_eight() {
        let mut heap = ALLOCATOR.lock();
        let ptr = heap.allocate_aligned(32, 1).expect("alloc failed");
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        heap.free_aligned(ptr);
    }

    #[test_case]
    fn test_basic_heap_alloc() {
        let base = Box::new(42);
        assert_eq!(*base, 42);
    }

    #[test_case]
    fn test_vector_alloc() {
        let mut vec = Vec::new();
        for i in 0..100 {
            vec.push(i);
        }

        assert_eq!(vec.len(), 100);
        let expected_sum: usize = (0..100).sum();
        let sum: usize = vec.iter().sum();

        assert_eq!(sum, expected_sum);
    }

    /// Allocates many boxes in a loop to stress the heap and ensure
    /// allocations do not overlap.
    #[test_case]
    fn test_many_allocations() {
        let mut boxes = Vec::new();
        for i in 0..1000 {
            boxes.push(Box::new(i));
        }
        for (i, b) in boxes.iter().enumerate() {
            assert_eq!(**b, i);
        }
    }

    #[test_case]
    fn test_string_allocation() {
        let s = String::from("Hello, kernel heap!");
        assert_eq!(s, "Hello, kernel heap!");
    }

    #[test_case]
    fn test_large_allocation() {
        let size = 1024 * 512;
        let vec: Vec<u8> = vec![1; size];

        assert_eq!(vec.len(), size);

        assert!(vec.iter().all(|&b| b == 1));
    }
}
