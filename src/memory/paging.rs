//! Four-level page-table walking over the shared kernel address space.
//!
//! All tables are reached through the direct physical mapping; a walk never
//! touches a non-present entry. Mid-walk allocation failure abandons the
//! operation early and leaves any tables already allocated in place.

use crate::constants::memory::{KERNEL_PML4_SPLIT, PAGE_SIZE, PAGE_TABLE_ENTRIES};
use crate::memory::{tlb, MemoryManager};
use x86_64::{
    structures::paging::{page_table::PageTableEntry, PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const HUGE_1G_OFFSET: u64 = 0x3FFF_FFFF;
const HUGE_2M_OFFSET: u64 = 0x1F_FFFF;

impl MemoryManager {
    /// Allocates and zeroes a fresh top-level page table.
    pub fn create_page_directory(&self) -> Option<PhysFrame> {
        let phys = self.alloc_page()?;
        let frame = PhysFrame::containing_address(phys);
        unsafe { (*self.hhdm().table(frame)).zero() };
        Some(frame)
    }

    /// Installs a 4 KiB translation `virt -> phys` under `root`, allocating
    /// intermediate tables on demand and invalidating the stale translation
    /// for `virt`.
    ///
    /// A user-accessible mapping forces the user bit on every level of the
    /// walk, and a large mapping sitting where a table is needed is replaced
    /// by a fresh table; whatever the large mapping covered is gone and is
    /// the caller's responsibility to restore.
    pub fn map_page(&self, root: PhysFrame, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) {
        let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);

        let l4 = unsafe { &mut *self.hhdm().table(root) };
        let Some(l3) = self.next_table(&mut l4[virt.p4_index()], user) else {
            return;
        };
        let Some(l2) = self.next_table(&mut l3[virt.p3_index()], user) else {
            return;
        };
        let Some(l1) = self.next_table(&mut l2[virt.p2_index()], user) else {
            return;
        };

        l1[virt.p1_index()].set_addr(phys.align_down(PAGE_SIZE), flags);
        tlb::flush(virt);
    }

    /// Removes the 4 KiB translation for `virt`, if any. Intermediate
    /// tables are left in place even when they become empty, and an address
    /// that was never mapped is a no-op.
    pub fn unmap_page(&self, root: PhysFrame, virt: VirtAddr) {
        let l4 = unsafe { &*self.hhdm().table(root) };
        let Some(l3) = self.read_table(&l4[virt.p4_index()]) else {
            return;
        };
        let Some(l2) = self.read_table(&l3[virt.p3_index()]) else {
            return;
        };
        let Some(l1) = self.read_table_mut(&l2[virt.p2_index()]) else {
            return;
        };

        l1[virt.p1_index()].set_unused();
        tlb::flush(virt);
    }

    /// Pure walk from `root`; None means `virt` has no translation.
    pub fn virt_to_phys(&self, root: PhysFrame, virt: VirtAddr) -> Option<PhysAddr> {
        let l4 = unsafe { &*self.hhdm().table(root) };

        let e4 = &l4[virt.p4_index()];
        let l3 = self.read_table(e4)?;

        let e3 = &l3[virt.p3_index()];
        if !e3.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if e3.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(e3.addr() + (virt.as_u64() & HUGE_1G_OFFSET));
        }
        let l2 = unsafe { &*self.table_at(e3) };

        let e2 = &l2[virt.p2_index()];
        if !e2.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if e2.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(e2.addr() + (virt.as_u64() & HUGE_2M_OFFSET));
        }
        let l1 = unsafe { &*self.table_at(e2) };

        let e1 = &l1[virt.p1_index()];
        if !e1.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(e1.addr() + u64::from(virt.page_offset()))
    }

    /// Allocates a new top-level table and shallow-copies all 512 entries of
    /// the kernel's active root, so the clone shares every mapping with it.
    pub fn clone_page_directory(&self) -> Option<PhysFrame> {
        let src = unsafe { &*self.hhdm().table(self.kernel_pml4()) };
        let frame = self.create_page_directory()?;
        let dst = unsafe { &mut *self.hhdm().table(frame) };
        for i in 0..PAGE_TABLE_ENTRIES {
            dst[i] = src[i].clone();
        }
        Some(frame)
    }

    /// Frees the page-table structures of the lower half of `root`,
    /// including `root` itself. Leaf data pages are untouched, as are the
    /// tables behind large mappings and the shared kernel half.
    pub fn free_page_directory(&self, root: PhysFrame) {
        let l4 = unsafe { &*self.hhdm().table(root) };

        for i4 in 0..KERNEL_PML4_SPLIT {
            let e4 = &l4[i4];
            let Some(l3) = self.read_table(e4) else {
                continue;
            };
            for i3 in 0..PAGE_TABLE_ENTRIES {
                let e3 = &l3[i3];
                let Some(l2) = self.read_table(e3) else {
                    continue;
                };
                for i2 in 0..PAGE_TABLE_ENTRIES {
                    let e2 = &l2[i2];
                    if self.read_table(e2).is_some() {
                        self.free_page(e2.addr());
                    }
                }
                self.free_page(e3.addr());
            }
            self.free_page(e4.addr());
        }

        self.free_page(root.start_address());
    }

    /// Releases everything a task mapped in `[start, end)`: each mapped
    /// physical page is freed and unmapped, then the lower-half table
    /// structures of `root` are torn down.
    pub fn free_task_address_space(&self, root: PhysFrame, start: VirtAddr, end: VirtAddr) {
        let mut virt = start.as_u64();
        while virt < end.as_u64() {
            let vaddr = VirtAddr::new(virt);
            if let Some(phys) = self.virt_to_phys(root, vaddr) {
                self.free_page(phys.align_down(PAGE_SIZE));
                self.unmap_page(root, vaddr);
            }
            virt += PAGE_SIZE;
        }
        self.free_page_directory(root);
    }

    /// Steps one level down through `entry`, allocating and zeroing the next
    /// table when the entry is empty and replacing it when a large mapping
    /// is in the way. Promotes the entry to user-accessible when the mapping
    /// being installed needs it.
    fn next_table(&self, entry: &mut PageTableEntry, user: bool) -> Option<&'static mut PageTable> {
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
            let phys = self.alloc_page()?;
            let frame = PhysFrame::containing_address(phys);
            unsafe { (*self.hhdm().table(frame)).zero() };

            let mut table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            if user {
                table_flags |= PageTableFlags::USER_ACCESSIBLE;
            }
            entry.set_addr(phys, table_flags);
        } else if user && !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
            entry.set_flags(flags | PageTableFlags::USER_ACCESSIBLE);
        }

        Some(unsafe { &mut *self.table_at(entry) })
    }

    /// Follows a present, non-large entry to its child table.
    fn read_table(&self, entry: &PageTableEntry) -> Option<&'static PageTable> {
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
            return None;
        }
        Some(unsafe { &*self.table_at(entry) })
    }

    fn read_table_mut(&self, entry: &PageTableEntry) -> Option<&'static mut PageTable> {
        self.read_table(entry)?;
        Some(unsafe { &mut *self.table_at(entry) })
    }

    fn table_at(&self, entry: &PageTableEntry) -> *mut PageTable {
        let frame = PhysFrame::containing_address(PhysAddr::new(entry.addr().as_u64() & FRAME_MASK));
        self.hhdm().table(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PhysArena;

    fn rw() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE
    }

    fn rwu() -> PageTableFlags {
        rw() | PageTableFlags::USER_ACCESSIBLE
    }

    #[test]
    fn map_then_translate_then_unmap() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();
        let root = mm.create_page_directory().unwrap();

        let virt = VirtAddr::new(0x4000_2000);
        let phys = mm.alloc_page().unwrap();
        mm.map_page(root, virt, phys, rw());

        assert_eq!(mm.virt_to_phys(root, virt), Some(phys));
        // Offsets within the page carry through the walk.
        assert_eq!(mm.virt_to_phys(root, virt + 123u64), Some(phys + 123u64));

        mm.unmap_page(root, virt);
        assert_eq!(mm.virt_to_phys(root, virt), None);
    }

    #[test]
    fn unmap_keeps_intermediate_tables() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();
        let root = mm.create_page_directory().unwrap();

        let virt = VirtAddr::new(0x4000_0000);
        let phys = mm.alloc_page().unwrap();
        mm.map_page(root, virt, phys, rw());
        mm.unmap_page(root, virt);

        // Remapping the same address must not need new tables.
        let free_before = mm.free_memory();
        mm.map_page(root, virt, phys, rw());
        assert_eq!(mm.free_memory(), free_before);
        assert_eq!(mm.virt_to_phys(root, virt), Some(phys));
    }

    #[test]
    fn translate_unmapped_is_none() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();
        let root = mm.create_page_directory().unwrap();
        assert_eq!(mm.virt_to_phys(root, VirtAddr::new(0xdead_b000)), None);
        // Unmapping it is a harmless no-op.
        mm.unmap_page(root, VirtAddr::new(0xdead_b000));
    }

    #[test]
    fn user_mapping_promotes_every_level() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();
        let root = mm.create_page_directory().unwrap();

        // Kernel-only mapping first, then a user mapping in the same region.
        let kvirt = VirtAddr::new(0x5000_0000);
        let uvirt = VirtAddr::new(0x5000_1000);
        mm.map_page(root, kvirt, mm.alloc_page().unwrap(), rw());
        mm.map_page(root, uvirt, mm.alloc_page().unwrap(), rwu());

        let l4 = unsafe { &*mm.hhdm().table(root) };
        let e4 = &l4[uvirt.p4_index()];
        assert!(e4.flags().contains(PageTableFlags::USER_ACCESSIBLE));
        let l3 = unsafe { &*mm.table_at(e4) };
        let e3 = &l3[uvirt.p3_index()];
        assert!(e3.flags().contains(PageTableFlags::USER_ACCESSIBLE));
        let l2 = unsafe { &*mm.table_at(e3) };
        let e2 = &l2[uvirt.p2_index()];
        assert!(e2.flags().contains(PageTableFlags::USER_ACCESSIBLE));
    }

    #[test]
    fn large_mapping_is_replaced_by_a_table() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();
        let root = mm.create_page_directory().unwrap();

        let virt = VirtAddr::new(0x6000_0000);
        // Build the walk down to the level-2 table, then plant a 2 MiB
        // mapping over the region.
        mm.map_page(root, virt, mm.alloc_page().unwrap(), rw());
        mm.unmap_page(root, virt);
        let l4 = unsafe { &*mm.hhdm().table(root) };
        let l3 = unsafe { &*mm.table_at(&l4[virt.p4_index()]) };
        let l2 = unsafe { &mut *mm.table_at(&l3[virt.p3_index()]) };
        l2[virt.p2_index()].set_addr(
            PhysAddr::new(0x20_0000),
            rw() | PageTableFlags::HUGE_PAGE,
        );
        assert_eq!(
            mm.virt_to_phys(root, virt + 0x1234u64),
            Some(PhysAddr::new(0x20_1234))
        );

        // A 4 KiB mapping in the same region evicts the large one.
        let phys = mm.alloc_page().unwrap();
        mm.map_page(root, virt, phys, rw());
        assert_eq!(mm.virt_to_phys(root, virt), Some(phys));
        // The rest of the old 2 MiB range is gone, not preserved.
        assert_eq!(mm.virt_to_phys(root, virt + 0x1000u64), None);
    }

    #[test]
    fn clone_shares_all_mappings() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();

        let virt = VirtAddr::new(0x7000_0000);
        let phys = mm.alloc_page().unwrap();
        mm.map_page(mm.kernel_pml4(), virt, phys, rw());

        let clone = mm.clone_page_directory().unwrap();
        assert_eq!(mm.virt_to_phys(clone, virt), Some(phys));

        // A mapping added afterwards through the original root lands in a
        // shared lower-level table, so the clone sees it too.
        let virt2 = VirtAddr::new(0x7000_5000);
        let phys2 = mm.alloc_page().unwrap();
        mm.map_page(mm.kernel_pml4(), virt2, phys2, rw());
        assert_eq!(mm.virt_to_phys(clone, virt2), Some(phys2));
    }

    #[test]
    fn address_space_teardown_returns_all_frames() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();

        let baseline = mm.free_memory();
        let root = mm.create_page_directory().unwrap();

        let start = VirtAddr::new(0x2000_0000);
        for i in 0..4u64 {
            let phys = mm.alloc_page().unwrap();
            mm.map_page(root, start + i * PAGE_SIZE, phys, rwu());
        }
        assert!(mm.free_memory() < baseline);

        mm.free_task_address_space(root, start, start + 4u64 * PAGE_SIZE);
        assert_eq!(mm.free_memory(), baseline);
    }
}
