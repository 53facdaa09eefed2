pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;
pub mod tlb;

use crate::boot::BootInfo;
use bitmap_frame_allocator::BitmapFrameAllocator;
use spin::Mutex;
use x86_64::{
    structures::paging::{PageTable, PhysFrame},
    PhysAddr,
};

/// Offset of the direct physical-memory mapping.
///
/// Every physical-to-virtual translation in the kernel goes through this
/// handle; nothing else is allowed to do the offset arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct HhdmOffset(u64);

impl HhdmOffset {
    pub const fn new(offset: u64) -> Self {
        HhdmOffset(offset)
    }

    /// Pointer to the byte backing `phys` in the direct mapping.
    pub fn ptr(self, phys: PhysAddr) -> *mut u8 {
        (self.0 + phys.as_u64()) as *mut u8
    }

    /// View a frame as the page-table node stored in it.
    pub(crate) fn table(self, frame: PhysFrame) -> *mut PageTable {
        self.ptr(frame.start_address()) as *mut PageTable
    }
}

/// Owns the physical page allocator and the kernel's shared top-level page
/// table. Page-table walking lives in [`paging`], heap setup in [`heap`].
pub struct MemoryManager {
    hhdm: HhdmOffset,
    frames: Mutex<BitmapFrameAllocator>,
    kernel_pml4: PhysFrame,
}

impl MemoryManager {
    /// Brings up the PMM from the boot memory map and allocates the kernel's
    /// top-level page table. Fatal if memory is below the boot minimum.
    pub fn init(boot: &BootInfo) -> Self {
        let hhdm = HhdmOffset::new(boot.hhdm_offset);
        let frames = Mutex::new(unsafe { BitmapFrameAllocator::init(boot.memory_map, hhdm) });

        let mut manager = MemoryManager {
            hhdm,
            frames,
            kernel_pml4: PhysFrame::containing_address(PhysAddr::new(0)),
        };
        manager.kernel_pml4 = manager
            .create_page_directory()
            .expect("out of memory creating the kernel page directory");
        manager
    }

    pub fn hhdm(&self) -> HhdmOffset {
        self.hhdm
    }

    /// The shared top-level page table every task runs under.
    pub fn kernel_pml4(&self) -> PhysFrame {
        self.kernel_pml4
    }

    pub fn alloc_page(&self) -> Option<PhysAddr> {
        self.frames.lock().alloc_pages(1)
    }

    pub fn alloc_pages(&self, count: usize) -> Option<PhysAddr> {
        self.frames.lock().alloc_pages(count)
    }

    pub fn free_page(&self, addr: PhysAddr) {
        self.frames.lock().free_pages(addr, 1)
    }

    pub fn free_pages(&self, addr: PhysAddr, count: usize) {
        self.frames.lock().free_pages(addr, count)
    }

    pub fn total_memory(&self) -> u64 {
        self.frames.lock().total_memory()
    }

    pub fn free_memory(&self) -> u64 {
        self.frames.lock().free_memory()
    }
}
