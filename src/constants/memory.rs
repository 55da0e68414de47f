pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Entries per page table at every level of the 4-level hierarchy.
pub const ENTRIES_PER_TABLE: usize = 512;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

/// Physical memory below this line is never handed out (BIOS/legacy region).
pub const LOW_MEMORY_RESERVED: u64 = 0x10_0000; // 1 MiB

/// Virtual base of the kernel heap. The heap grows upward from here in
/// frame-sized increments and never shrinks.
pub const HEAP_START: u64 = 0xFFFF_FFFF_0000_0000;

/// Minimum alignment and rounding granule for heap requests.
pub const HEAP_ALIGN: usize = 8;

/// A split only happens when the remainder could hold a header plus this
/// much payload; smaller tails stay inside the allocated block.
pub const HEAP_SPLIT_SLACK: usize = 8;
