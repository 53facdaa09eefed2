//! Boot-time platform boundary.
//!
//! The bootloader hands the kernel a physical memory map and the offset of
//! the direct physical mapping. These types are the crate's view of that
//! handoff; producing them from a concrete boot protocol is the platform
//! shim's job.

/// Classification of one memory-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free for kernel use.
    Usable,
    /// Firmware, MMIO, bootloader reclaimable, or otherwise off limits.
    Reserved,
}

/// One contiguous physical range reported by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub const fn usable(base: u64, length: u64) -> Self {
        MemoryRegion {
            base,
            length,
            kind: MemoryRegionKind::Usable,
        }
    }

    pub const fn reserved(base: u64, length: u64) -> Self {
        MemoryRegion {
            base,
            length,
            kind: MemoryRegionKind::Reserved,
        }
    }
}

/// Everything the kernel core needs from the boot collaborator.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    /// Physical memory map, usable ranges tagged as such.
    pub memory_map: &'a [MemoryRegion],
    /// Offset at which all of physical memory is mapped into the kernel's
    /// virtual address space.
    pub hhdm_offset: u64,
}
