pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

/// Boot fails below this much usable physical memory.
pub const MIN_TOTAL_MEMORY: u64 = 80 * 1024 * 1024;

/// The kernel heap arena is carved out of the PMM once, at this size.
pub const HEAP_PAGES: usize = 16384; // 64 MiB
pub const HEAP_ALIGN: usize = 8;

/// Entries 256..512 of the top-level table are the shared kernel half and
/// are never torn down.
pub const KERNEL_PML4_SPLIT: usize = 256;
pub const PAGE_TABLE_ENTRIES: usize = 512;
