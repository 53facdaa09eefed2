use crate::{
    boot::{MemoryRegion, MemoryRegionKind},
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, MIN_TOTAL_MEMORY},
    memory::HhdmOffset,
};
use x86_64::PhysAddr;

/// Bitmap over every page frame in `[memory_base, memory_top)`, one bit per
/// frame, set = used. The bitmap itself lives in the first usable region
/// large enough to hold it and its backing frames are marked used.
pub struct BitmapFrameAllocator {
    bitmap: *mut u64,
    bitmap_words: usize,
    total_pages: u64,
    used_pages: u64,
    memory_base: u64,
    memory_top: u64,
}

// The raw bitmap pointer is only touched through &mut self, and the
// allocator always sits behind a Mutex.
unsafe impl Send for BitmapFrameAllocator {}

impl BitmapFrameAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// Panics if the map contains no usable region that fits the bitmap, or
    /// if total memory is below [`MIN_TOTAL_MEMORY`]. Both are boot-time
    /// conditions with no recovery.
    ///
    /// # Safety
    ///
    /// Usable regions in `memory_map` must be free RAM reachable through
    /// `hhdm`, and nothing else may hand them out afterwards.
    pub unsafe fn init(memory_map: &[MemoryRegion], hhdm: HhdmOffset) -> Self {
        let mut memory_base = u64::MAX;
        let mut memory_top = 0;
        for entry in memory_map {
            if entry.kind == MemoryRegionKind::Usable {
                memory_base = memory_base.min(entry.base);
                memory_top = memory_top.max(entry.base + entry.length);
            }
        }
        if memory_base >= memory_top {
            panic!("boot memory map contains no usable memory");
        }

        let total_pages = (memory_top - memory_base) / FRAME_SIZE as u64;
        let bitmap_words = (total_pages as usize).div_ceil(BITMAP_ENTRY_SIZE);
        let bitmap_bytes = bitmap_words * 8;

        // Place the bitmap inside the first usable region that fits it.
        let bitmap_phys = memory_map
            .iter()
            .find(|e| e.kind == MemoryRegionKind::Usable && e.length >= bitmap_bytes as u64)
            .map(|e| e.base)
            .expect("no usable region large enough for the frame bitmap");

        let bitmap = hhdm.ptr(PhysAddr::new(bitmap_phys)) as *mut u64;
        for word in 0..bitmap_words {
            bitmap.add(word).write(FULL_BITMAP_ENTRY);
        }

        let mut allocator = Self {
            bitmap,
            bitmap_words,
            total_pages,
            used_pages: total_pages,
            memory_base,
            memory_top,
        };

        for entry in memory_map {
            if entry.kind == MemoryRegionKind::Usable {
                allocator.free_region(entry.base, entry.length);
            }
        }

        // The bitmap's own backing frames sit in a usable region and were
        // just cleared; re-mark them used.
        let bitmap_start = (bitmap_phys - memory_base) / FRAME_SIZE as u64;
        let bitmap_pages = (bitmap_bytes as u64).div_ceil(FRAME_SIZE as u64);
        for i in 0..bitmap_pages {
            let frame = bitmap_start + i;
            if frame < allocator.total_pages && !allocator.is_bit_set(frame) {
                allocator.set_bit(frame);
                allocator.used_pages += 1;
            }
        }

        let total = allocator.total_memory();
        if total < MIN_TOTAL_MEMORY {
            panic!(
                "minimum {} MiB of physical memory required, found {} MiB",
                MIN_TOTAL_MEMORY / (1024 * 1024),
                total / (1024 * 1024)
            );
        }

        log::info!(
            "PMM initialized: {} MiB total, {} MiB free",
            total / (1024 * 1024),
            allocator.free_memory() / (1024 * 1024)
        );
        allocator
    }

    /// Mark the region [base, base + length) as free in the bitmap.
    fn free_region(&mut self, base: u64, length: u64) {
        let start_frame = (base - self.memory_base) / FRAME_SIZE as u64;
        let frame_count = length / FRAME_SIZE as u64;
        for i in 0..frame_count {
            let frame = start_frame + i;
            if frame < self.total_pages && self.is_bit_set(frame) {
                self.clear_bit(frame);
                self.used_pages -= 1;
            }
        }
    }

    /// Allocates `count` contiguous frames, first fit from the bottom.
    /// Returns the base physical address, or None when no run exists.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        let start = self.find_free_pages(count)?;
        for i in 0..count as u64 {
            self.set_bit(start + i);
            self.used_pages += 1;
        }
        Some(PhysAddr::new(self.memory_base + start * FRAME_SIZE as u64))
    }

    /// Returns `count` frames starting at `addr` to the free pool.
    ///
    /// Addresses outside the managed span are ignored, as are frames that
    /// are already free; the used counter stays exact either way.
    pub fn free_pages(&mut self, addr: PhysAddr, count: usize) {
        let addr = addr.as_u64();
        if addr < self.memory_base || addr >= self.memory_top {
            log::warn!("free_pages: {:#x} outside managed memory, ignored", addr);
            return;
        }
        let start = (addr - self.memory_base) / FRAME_SIZE as u64;
        for i in 0..count as u64 {
            let frame = start + i;
            if frame < self.total_pages && self.is_bit_set(frame) {
                self.clear_bit(frame);
                self.used_pages -= 1;
            }
        }
    }

    pub fn total_memory(&self) -> u64 {
        self.total_pages * FRAME_SIZE as u64
    }

    pub fn free_memory(&self) -> u64 {
        (self.total_pages - self.used_pages) * FRAME_SIZE as u64
    }

    /// Check if the frame containing `addr` is currently allocated.
    pub fn is_frame_used(&self, addr: PhysAddr) -> bool {
        let addr = addr.as_u64();
        if addr < self.memory_base || addr >= self.memory_top {
            return false;
        }
        self.is_bit_set((addr - self.memory_base) / FRAME_SIZE as u64)
    }

    /// First-fit scan for `count` contiguous clear bits. The single-frame
    /// path skips fully allocated words instead of probing bit by bit.
    fn find_free_pages(&self, count: usize) -> Option<u64> {
        if count as u64 > self.total_pages {
            return None;
        }
        if count == 1 {
            let mut i = 0;
            while i < self.total_pages {
                if i % BITMAP_ENTRY_SIZE as u64 == 0
                    && self.word((i / BITMAP_ENTRY_SIZE as u64) as usize) == FULL_BITMAP_ENTRY
                {
                    i += BITMAP_ENTRY_SIZE as u64;
                    continue;
                }
                if !self.is_bit_set(i) {
                    return Some(i);
                }
                i += 1;
            }
            return None;
        }
        for i in 0..=(self.total_pages - count as u64) {
            let mut found = true;
            for j in 0..count as u64 {
                if self.is_bit_set(i + j) {
                    found = false;
                    break;
                }
            }
            if found {
                return Some(i);
            }
        }
        None
    }

    fn word(&self, index: usize) -> u64 {
        debug_assert!(index < self.bitmap_words);
        unsafe { self.bitmap.add(index).read() }
    }

    fn set_bit(&mut self, frame_index: u64) {
        debug_assert!(frame_index < self.total_pages);
        let word = (frame_index / BITMAP_ENTRY_SIZE as u64) as usize;
        let bit = frame_index % BITMAP_ENTRY_SIZE as u64;
        unsafe {
            let p = self.bitmap.add(word);
            p.write(p.read() | (1 << bit));
        }
    }

    fn clear_bit(&mut self, frame_index: u64) {
        debug_assert!(frame_index < self.total_pages);
        let word = (frame_index / BITMAP_ENTRY_SIZE as u64) as usize;
        let bit = frame_index % BITMAP_ENTRY_SIZE as u64;
        unsafe {
            let p = self.bitmap.add(word);
            p.write(p.read() & !(1 << bit));
        }
    }

    fn is_bit_set(&self, frame_index: u64) -> bool {
        debug_assert!(frame_index < self.total_pages);
        let word = (frame_index / BITMAP_ENTRY_SIZE as u64) as usize;
        let bit = frame_index % BITMAP_ENTRY_SIZE as u64;
        (self.word(word) & (1 << bit)) != 0
    }
}
