//! Explicit 4-level page-table management.
//!
//! Tables are reached through the higher-half direct map, so a physical
//! frame holding a table is always one address computation away. The active
//! address space is whatever CR3 holds; `map_page`/`unmap_page` operate on
//! it, the `_in` variants take a root explicitly so a not-yet-active space
//! can be populated (process construction does this).

use x86_64::{
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{page_table::PageTableEntry, PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::ENTRIES_PER_TABLE;
use crate::memory::{frame_allocator::alloc_frame, phys_to_virt, MemoryError};

/// Flags for intermediate tables: always maximally permissive. Access
/// policy is enforced at the leaf entry only.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Table address-space root currently loaded in CR3.
pub fn active_root() -> PhysFrame {
    let (frame, _) = Cr3::read();
    frame
}

/// Switches the executing core to `root`. Global state, no save/restore.
///
/// # Safety
///
/// `root` must point at a valid top-level table that keeps the currently
/// executing code and stack mapped.
pub unsafe fn set_active_root(root: PhysFrame) {
    Cr3::write(root, Cr3Flags::empty());
}

fn table_of(frame: PhysFrame) -> *mut PageTable {
    phys_to_virt(frame.start_address()).as_mut_ptr()
}

/// Maps `vaddr` to `paddr` under the active address space. See
/// [`map_page_in`].
pub fn map_page(vaddr: VirtAddr, paddr: PhysAddr, flags: PageTableFlags) -> Result<(), MemoryError> {
    map_page_in(active_root(), vaddr, paddr, flags)
}

/// Maps the page containing `vaddr` to the frame at `paddr` under `root`.
///
/// Absent intermediate levels get a fresh zeroed frame. An existing leaf is
/// silently overwritten, last write wins. On intermediate allocation
/// failure, tables installed before the failure stay in place.
pub fn map_page_in(
    root: PhysFrame,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MemoryError> {
    let mut table = unsafe { &mut *table_of(root) };

    for index in [vaddr.p4_index(), vaddr.p3_index(), vaddr.p2_index()] {
        let entry = &mut table[index];
        let frame = if entry.flags().contains(PageTableFlags::PRESENT) {
            // 2 MiB and 1 GiB mappings are never installed by this kernel
            entry.frame().map_err(|_| MemoryError::MappingFailedMidway)?
        } else {
            let frame = alloc_frame().ok_or(MemoryError::MappingFailedMidway)?;
            unsafe { (*table_of(frame)).zero() };
            entry.set_frame(frame, TABLE_FLAGS);
            frame
        };
        table = unsafe { &mut *table_of(frame) };
    }

    table[vaddr.p1_index()].set_addr(paddr, flags | PageTableFlags::PRESENT);
    if root == active_root() {
        tlb::flush(vaddr);
    }
    Ok(())
}

/// Unmaps `vaddr` from the active address space. See [`unmap_page_in`].
pub fn unmap_page(vaddr: VirtAddr) -> Result<(), MemoryError> {
    unmap_page_in(active_root(), vaddr)
}

/// Clears the leaf entry for `vaddr` under `root` and invalidates that one
/// translation. Fails without mutating anything if any level of the walk is
/// absent. Intermediate tables that become empty are not reclaimed.
pub fn unmap_page_in(root: PhysFrame, vaddr: VirtAddr) -> Result<(), MemoryError> {
    let leaf = walk_to_leaf(root, vaddr)?;
    if !leaf.flags().contains(PageTableFlags::PRESENT) {
        return Err(MemoryError::NotMapped);
    }
    leaf.set_unused();
    if root == active_root() {
        tlb::flush(vaddr);
    }
    Ok(())
}

/// Physical address and leaf flags `vaddr` translates to under the active
/// address space, or `None` when the walk misses.
pub fn translate(vaddr: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
    translate_in(active_root(), vaddr)
}

/// Physical address and leaf flags `vaddr` translates to under `root`.
pub fn translate_in(root: PhysFrame, vaddr: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
    let leaf = walk_to_leaf(root, vaddr).ok()?;
    if !leaf.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let frame = leaf.frame().ok()?;
    Some((frame.start_address() + u64::from(vaddr.page_offset()), leaf.flags()))
}

/// Allocates a fresh top-level table and copies all 512 entries of
/// `src_root` verbatim. The clone is shallow: every lower-level table stays
/// shared between the two roots, so at the instant of cloning every address
/// translates identically under both, and a later edit to a shared lower
/// table is visible through both. No copy-on-write.
pub fn clone_root(src_root: PhysFrame) -> Result<PhysFrame, MemoryError> {
    let new_root = alloc_frame().ok_or(MemoryError::FrameExhaustion)?;
    let src = unsafe { &*table_of(src_root) };
    let dst = unsafe { &mut *table_of(new_root) };
    for i in 0..ENTRIES_PER_TABLE {
        dst[i] = src[i].clone();
    }
    Ok(new_root)
}

/// Walks the three upper levels and returns the leaf entry for `vaddr`.
/// `Err(NotMapped)` if any level on the way is absent; nothing is mutated.
fn walk_to_leaf(
    root: PhysFrame,
    vaddr: VirtAddr,
) -> Result<&'static mut PageTableEntry, MemoryError> {
    let mut table = unsafe { &mut *table_of(root) };
    for index in [vaddr.p4_index(), vaddr.p3_index(), vaddr.p2_index()] {
        let entry = &table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MemoryError::NotMapped);
        }
        let frame = entry.frame().map_err(|_| MemoryError::NotMapped)?;
        table = unsafe { &mut *table_of(frame) };
    }
    Ok(&mut table[vaddr.p1_index()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::{dealloc_frame, with_frame_allocator};

    // Far away from the kernel image, the heap and user process images.
    const TEST_BASE: u64 = 0x5AB0_0000_0000;

    #[test_case]
    fn test_map_translate_round_trip() {
        let vaddr = VirtAddr::new(TEST_BASE);
        let frame = alloc_frame().expect("alloc failed");

        map_page(vaddr, frame.start_address(), PageTableFlags::WRITABLE).expect("map failed");

        let (paddr, flags) = translate(vaddr).expect("translation missed");
        assert_eq!(paddr, frame.start_address());
        assert!(flags.contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE));

        unmap_page(vaddr).expect("unmap failed");
        dealloc_frame(frame);
    }

    #[test_case]
    fn test_remap_last_write_wins() {
        let vaddr = VirtAddr::new(TEST_BASE + 0x1000);
        let first = alloc_frame().expect("alloc failed");
        let second = alloc_frame().expect("alloc failed");

        map_page(vaddr, first.start_address(), PageTableFlags::WRITABLE).expect("map failed");
        map_page(vaddr, second.start_address(), PageTableFlags::empty()).expect("remap failed");

        let (paddr, flags) = translate(vaddr).expect("translation missed");
        assert_eq!(paddr, second.start_address());
        assert!(!flags.contains(PageTableFlags::WRITABLE));

        unmap_page(vaddr).expect("unmap failed");
        dealloc_frame(first);
        dealloc_frame(second);
    }

    #[test_case]
    fn test_intermediate_tables_fully_permissive() {
        // fresh P3/P2 slots so the walk below only sees tables this
        // kernel installed itself
        let vaddr = VirtAddr::new(TEST_BASE + 0x4000_0000);
        let frame = alloc_frame().expect("alloc failed");
        map_page(vaddr, frame.start_address(), PageTableFlags::empty()).expect("map failed");

        // access policy lives in the leaf alone; every level above it must
        // be wide open even when the leaf grants nothing
        let mut table = unsafe { &*table_of(active_root()) };
        for index in [vaddr.p4_index(), vaddr.p3_index(), vaddr.p2_index()] {
            let entry = &table[index];
            assert!(entry.flags().contains(TABLE_FLAGS));
            let next = entry.frame().expect("intermediate entry is not a table");
            table = unsafe { &*table_of(next) };
        }
        assert_eq!(table[vaddr.p1_index()].flags(), PageTableFlags::PRESENT);

        unmap_page(vaddr).expect("unmap failed");
        dealloc_frame(frame);
    }

    #[test_case]
    fn test_unmap_missing_mutates_nothing() {
        let vaddr = VirtAddr::new(TEST_BASE + 0x8000_0000); // untouched region
        let free_before = with_frame_allocator(|a| a.free_frames());

        assert_eq!(unmap_page(vaddr), Err(MemoryError::NotMapped));
        assert!(translate(vaddr).is_none());
        assert_eq!(with_frame_allocator(|a| a.free_frames()), free_before);
    }

    #[test_case]
    fn test_clone_root_is_shallow() {
        let vaddr = VirtAddr::new(TEST_BASE + 0x2000);
        let frame = alloc_frame().expect("alloc failed");
        map_page(vaddr, frame.start_address(), PageTableFlags::WRITABLE).expect("map failed");

        let root = active_root();
        let clone = clone_root(root).expect("clone failed");

        // identical translations at the instant of cloning
        assert_eq!(translate_in(clone, vaddr), translate_in(root, vaddr));

        // the lower tables are shared: a leaf written through the source
        // root afterwards is observed through the clone (no copy-on-write)
        let vaddr2 = VirtAddr::new(TEST_BASE + 0x3000);
        let frame2 = alloc_frame().expect("alloc failed");
        map_page(vaddr2, frame2.start_address(), PageTableFlags::WRITABLE).expect("map failed");
        let (paddr, _) = translate_in(clone, vaddr2).expect("clone missed shared mapping");
        assert_eq!(paddr, frame2.start_address());

        unmap_page(vaddr).expect("unmap failed");
        unmap_page(vaddr2).expect("unmap failed");
        dealloc_frame(frame);
        dealloc_frame(frame2);
        dealloc_frame(clone);
    }
}
