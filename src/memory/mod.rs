//! Physical frame allocation, address translation and the kernel heap.
//!
//! Dependencies run strictly upward: the heap grows through the paging layer,
//! the paging layer takes backing frames from the frame allocator, and the
//! frame allocator depends on nothing but the boot memory map.

pub mod frame_allocator;
pub mod heap;
pub mod paging;

use lazy_static::lazy_static;
use limine::request::{HhdmRequest, MemoryMapRequest};
use limine::{memory_map::EntryType, response::MemoryMapResponse};
use x86_64::{PhysAddr, VirtAddr};

use crate::constants::memory::FRAME_SIZE;
use frame_allocator::{BitmapFrameAllocator, FRAME_ALLOCATOR};

#[used]
#[link_section = ".requests"]
pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
pub static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

lazy_static! {
    pub static ref HHDM_OFFSET: VirtAddr = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset()
    );
}

/// Virtual address through which `paddr` can be accessed, courtesy of the
/// bootloader's higher-half direct map of all physical memory.
pub fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
    *HHDM_OFFSET + paddr.as_u64()
}

/// Failures of the memory core. Every error surfaces to the immediate
/// caller; this layer never retries and never logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The frame allocator has no free frame left.
    FrameExhaustion,
    /// A translation walk hit an absent entry.
    NotMapped,
    /// An intermediate table could not be allocated during `map_page`.
    /// Tables installed before the failure stay allocated.
    MappingFailedMidway,
}

/// Top of usable physical memory in bytes, per the boot memory map.
fn top_of_physical_memory(memory_map: &MemoryMapResponse) -> usize {
    let mut true_end: usize = 0;
    for entry in memory_map.entries().iter() {
        if entry.entry_type == EntryType::USABLE {
            let end_addr = (entry.base + entry.length) as usize;
            if end_addr > true_end {
                true_end = end_addr;
            }
        }
    }
    true_end
}

/// Builds the frame bitmap and installs the global frame allocator.
/// Must run on the boot CPU before anything else allocates.
pub fn init(cpu_id: u32) {
    if cpu_id == 0 {
        let memory_map: &MemoryMapResponse = MEMORY_MAP_REQUEST
            .get_response()
            .expect("Memory map request failed");
        let total_size = top_of_physical_memory(memory_map);

        unsafe {
            *FRAME_ALLOCATOR.lock() = Some(BitmapFrameAllocator::init(memory_map, total_size));
        }

        let (total, free) =
            frame_allocator::with_frame_allocator(|a| (a.total_frames(), a.free_frames()));
        log::info!(
            "physical memory: {} of {} frames free ({} MiB total)",
            free,
            total,
            total * FRAME_SIZE / (1024 * 1024)
        );
    }
}
