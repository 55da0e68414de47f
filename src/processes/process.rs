//! Process construction on top of the memory core.
//!
//! A process is created by cloning the kernel's address-space root (shallow,
//! kernel mappings stay shared) and mapping the image and a user stack under
//! the new root. External code depends on exactly the three fields recorded
//! here on success: the root handle, the entry address and the stack top.

extern crate alloc;

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;
use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame, Size4KiB},
    VirtAddr,
};

use crate::constants::memory::FRAME_SIZE;
use crate::constants::processes::{STACK_SIZE, STACK_START, USER_IMAGE_BASE};
use crate::memory::{frame_allocator::alloc_frame, paging, phys_to_virt, MemoryError};
use crate::serial_println;

// process counter must be thread-safe
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug)]
pub struct Pcb {
    pub pid: u32,
    /// Physical address of this process' top-level table.
    pub root: PhysFrame<Size4KiB>,
    pub entry: VirtAddr,
    pub stack_top: VirtAddr,
}

lazy_static::lazy_static! {
    pub static ref PROCESS_TABLE: Mutex<BTreeMap<u32, Arc<Pcb>>> = Mutex::new(BTreeMap::new());
}

pub fn print_process_table() {
    let table = PROCESS_TABLE.lock();
    serial_println!("\nProcess Table Contents:");
    serial_println!("========================");

    if table.is_empty() {
        serial_println!("No processes found");
    }
    for (pid, pcb) in table.iter() {
        serial_println!(
            "PID {}: root: {:?}, entry: {:#x}, stack top: {:#x}",
            pid,
            pcb.root.start_address(),
            pcb.entry,
            pcb.stack_top
        );
    }
    serial_println!("========================");
}

/// Builds a new address space for the flat binary `image` and registers the
/// resulting process. The image lands at `USER_IMAGE_BASE`, the stack right
/// below `STACK_START + STACK_SIZE`.
pub fn spawn(image: &[u8]) -> Result<Arc<Pcb>, MemoryError> {
    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    let root = paging::clone_root(paging::active_root())?;

    load_flat_image(root, image)?;
    map_user_stack(root)?;

    let process = Arc::new(Pcb {
        pid,
        root,
        entry: VirtAddr::new(USER_IMAGE_BASE),
        stack_top: VirtAddr::new(STACK_START + STACK_SIZE as u64),
    });

    PROCESS_TABLE.lock().insert(pid, Arc::clone(&process));
    Ok(process)
}

/// Maps `image` page by page under `root`, copying the bytes into the
/// backing frames through the direct map.
fn load_flat_image(root: PhysFrame, image: &[u8]) -> Result<(), MemoryError> {
    let user_flags =
        PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    for (i, chunk) in image.chunks(FRAME_SIZE).enumerate() {
        let frame = alloc_frame().ok_or(MemoryError::FrameExhaustion)?;
        let vaddr = VirtAddr::new(USER_IMAGE_BASE + (i * FRAME_SIZE) as u64);
        paging::map_page_in(root, vaddr, frame.start_address(), user_flags)?;

        let dest = phys_to_virt(frame.start_address()).as_mut_ptr::<u8>();
        unsafe {
            core::ptr::copy_nonoverlapping(chunk.as_ptr(), dest, chunk.len());
        }
    }
    Ok(())
}

fn map_user_stack(root: PhysFrame) -> Result<(), MemoryError> {
    let user_flags =
        PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    for i in 0..STACK_SIZE / FRAME_SIZE {
        let frame = alloc_frame().ok_or(MemoryError::FrameExhaustion)?;
        let vaddr = VirtAddr::new(STACK_START + (i * FRAME_SIZE) as u64);
        paging::map_page_in(root, vaddr, frame.start_address(), user_flags)?;
    }
    Ok(())
}
