//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame, bit set = allocated. The bitmap itself lives in
//! physical frames carved out of the first usable region and is addressed
//! through the higher-half direct map; it marks its own frames allocated.

use crate::constants::memory::{
    BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, LOW_MEMORY_RESERVED,
};
use crate::memory::phys_to_virt;
use limine::{
    memory_map::EntryType, request::KernelAddressRequest, response::MemoryMapResponse,
};
use spin::Mutex;
use x86_64::{
    align_up,
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

extern "C" {
    static _kernel_end: u64;
}

/// Global frame allocator so there is a single owner of the bitmap
/// throughout the kernel. The mutex is the lock a preemptible port needs
/// around alloc/free of the bitmap.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u64],
    total_frames: usize,
    free_frames: usize,
    // next frame index to try; wraps to 0 on a miss
    cursor: usize,
}

impl BitmapFrameAllocator {
    /// Builds an allocator over `bitmap` storage covering `total_size` bytes
    /// of physical memory. Every frame starts allocated; the `usable`
    /// `(base, length)` ranges are then freed. Reservations on top of the
    /// usable ranges are the caller's job, via `reserve_region`.
    pub fn new(
        bitmap: &'static mut [u64],
        usable: impl Iterator<Item = (u64, u64)>,
        total_size: usize,
    ) -> Self {
        let total_frames = total_size.div_ceil(FRAME_SIZE);
        assert!(bitmap.len() * BITMAP_ENTRY_SIZE >= total_frames);

        bitmap.fill(FULL_BITMAP_ENTRY);

        let mut allocator = Self {
            bitmap,
            total_frames,
            free_frames: 0,
            cursor: 0,
        };

        for (base, length) in usable {
            allocator.free_region(base, length);
        }

        allocator
    }

    /// Sizes the bitmap from the boot memory map, places its backing frames
    /// in the first usable region past the legacy low-memory area and the
    /// kernel image, and reserves kernel, low memory and the bitmap itself.
    ///
    /// # Safety
    ///
    /// Must run once, before any frame is handed out, with the Limine
    /// higher-half direct map active.
    pub unsafe fn init(memory_map: &'static MemoryMapResponse, total_size: usize) -> Self {
        let kernel_address = KERNEL_ADDRESS_REQUEST
            .get_response()
            .expect("Kernel address request failed");
        let kernel_start = kernel_address.physical_base();
        let kernel_end =
            (_kernel_end) - kernel_address.virtual_base() + kernel_start;

        let total_frames = total_size.div_ceil(FRAME_SIZE);
        let bitmap_words = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        let bitmap_bytes = bitmap_words * core::mem::size_of::<u64>();

        let storage_base = find_bitmap_storage(memory_map, kernel_start, kernel_end, bitmap_bytes)
            .expect("no usable region large enough for the frame bitmap");

        let bitmap = core::slice::from_raw_parts_mut(
            phys_to_virt(PhysAddr::new(storage_base)).as_mut_ptr::<u64>(),
            bitmap_words,
        );

        let usable = memory_map
            .entries()
            .iter()
            .filter(|e| e.entry_type == EntryType::USABLE)
            .map(|e| (e.base, e.length));

        let mut allocator = Self::new(bitmap, usable, total_size);
        allocator.reserve_region(0, LOW_MEMORY_RESERVED);
        allocator.reserve_region(kernel_start, kernel_end - kernel_start);
        allocator.reserve_region(storage_base, bitmap_bytes as u64);
        allocator
    }

    /// Allocates the lowest-indexed free frame at or after the internal
    /// cursor, wrapping to index 0 on a miss.
    pub fn alloc_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }
        let index = self
            .find_zero_bit(self.cursor)
            .or_else(|| self.find_zero_bit(0))?;
        self.mark_allocated(index);
        self.cursor = (index + 1) % self.total_frames;
        Some(PhysFrame::containing_address(PhysAddr::new(
            (index * FRAME_SIZE) as u64,
        )))
    }

    /// Returns `frame` to the free pool. The frame must have come from a
    /// prior `alloc_frame`; freeing anything else is caller error and is
    /// not detected.
    pub fn free_frame(&mut self, frame: PhysFrame) {
        self.mark_free(frame.start_address().as_u64() as usize / FRAME_SIZE);
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Check if frame is used. input: PhysFrame, output: bool
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        self.is_bit_set(frame.start_address().as_u64() as usize / FRAME_SIZE)
    }

    /// Index of the first clear bit at or after `start`, scanning a 64-bit
    /// word at a time: words that are all ones are skipped whole, then the
    /// lowest zero inside the first non-full word falls out of
    /// `(!word).trailing_zeros()`.
    pub fn find_zero_bit(&self, start: usize) -> Option<usize> {
        if start >= self.total_frames {
            return None;
        }
        let mut word_index = start / BITMAP_ENTRY_SIZE;
        // bits below `start` in the first word count as occupied
        let mut word = self.bitmap[word_index] | ((1u64 << (start % BITMAP_ENTRY_SIZE)) - 1);
        loop {
            if word != FULL_BITMAP_ENTRY {
                let index = word_index * BITMAP_ENTRY_SIZE + (!word).trailing_zeros() as usize;
                return (index < self.total_frames).then_some(index);
            }
            word_index += 1;
            if word_index >= self.bitmap.len() {
                return None;
            }
            word = self.bitmap[word_index];
        }
    }

    /// Mark the region [base, base + length) as free in the bitmap.
    fn free_region(&mut self, base: u64, length: u64) {
        let start_frame = base as usize / FRAME_SIZE;
        let end_frame = ((base + length) as usize / FRAME_SIZE).min(self.total_frames);
        for frame_index in start_frame..end_frame {
            self.mark_free(frame_index);
        }
    }

    /// Mark the region [base, base + length) as allocated, frame-granular,
    /// rounding the end up so partial frames are fully reserved.
    fn reserve_region(&mut self, base: u64, length: u64) {
        let start_frame = base as usize / FRAME_SIZE;
        let end_frame =
            (align_up(base + length, FRAME_SIZE as u64) as usize / FRAME_SIZE).min(self.total_frames);
        for frame_index in start_frame..end_frame {
            self.mark_allocated(frame_index);
        }
    }

    fn mark_allocated(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1u64 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask == 0 {
            self.bitmap[word_index] |= mask;
            self.free_frames -= 1;
        }
    }

    fn mark_free(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1u64 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask != 0 {
            self.bitmap[word_index] &= !mask;
            self.free_frames += 1;
        }
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1u64 << (frame_index % BITMAP_ENTRY_SIZE);
        self.bitmap[word_index] & mask != 0
    }
}

/// First frame-aligned physical address past low memory and the kernel
/// image with `bytes` of usable space behind it.
fn find_bitmap_storage(
    memory_map: &MemoryMapResponse,
    kernel_start: u64,
    kernel_end: u64,
    bytes: usize,
) -> Option<u64> {
    for entry in memory_map.entries().iter() {
        if entry.entry_type != EntryType::USABLE {
            continue;
        }
        let end = entry.base + entry.length;
        let mut base = entry.base.max(LOW_MEMORY_RESERVED);
        if base < kernel_end && end > kernel_start {
            base = base.max(kernel_end);
        }
        base = align_up(base, FRAME_SIZE as u64);
        if base < end && (end - base) as usize >= bytes {
            return Some(base);
        }
    }
    None
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_frame()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_frame(frame);
    }
}

/// Exposed function to allocate a frame that runs the global's alloc_frame
pub fn alloc_frame() -> Option<PhysFrame> {
    with_frame_allocator(|allocator| allocator.alloc_frame())
}

/// Exposed function to free a frame through the global allocator
pub fn dealloc_frame(frame: PhysFrame) {
    with_frame_allocator(|allocator| allocator.free_frame(frame))
}

pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    let mut guard = FRAME_ALLOCATOR.lock();
    if let Some(ref mut allocator) = *guard {
        f(allocator)
    } else {
        panic!("Frame allocator does not exist.");
    }
}
