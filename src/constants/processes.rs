pub const STACK_START: u64 = 0x7000_0000_0000;
pub const STACK_SIZE: usize = 2 * 4096; // 2 pages for the stack

/// Virtual address user images are loaded at. Lives in a top-level slot the
/// bootloader leaves empty, so image mappings never share lower tables with
/// the kernel's.
pub const USER_IMAGE_BASE: u64 = 0x6000_0000_0000;
