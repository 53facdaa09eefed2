//! The kernel heap.
//!
//! One arena is reserved from the PMM at boot and never grows. Blocks form
//! an address-ordered singly linked list of `BlockHeader`s, each directly
//! preceding its payload; blocks are identified by their byte offset from
//! the arena base. Freeing coalesces eagerly, so no two neighbors on the
//! list are ever both free.
//!
//! On bare metal the heap doubles as the crate's global allocator, so the
//! `alloc` collections used by the scheduler are backed by it.

use crate::constants::memory::{FRAME_SIZE, HEAP_ALIGN, HEAP_PAGES};
use crate::memory::MemoryManager;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use spin::Mutex;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Offset value marking the end of the block list.
const NIL: usize = usize::MAX;

#[repr(C)]
struct BlockHeader {
    /// Payload bytes available past this header.
    size: usize,
    /// Offset of the next block's header, or [`NIL`].
    next: usize,
    free: bool,
}

struct HeapArena {
    base: *mut u8,
    size: usize,
}

// The arena pointer is only dereferenced while the Mutex is held.
unsafe impl Send for HeapArena {}

impl HeapArena {
    const fn unclaimed() -> HeapArena {
        HeapArena {
            base: core::ptr::null_mut(),
            size: 0,
        }
    }

    /// # Safety
    ///
    /// `off` must be the offset of a live block header inside the arena.
    #[allow(clippy::mut_from_ref)]
    unsafe fn header(&self, off: usize) -> &mut BlockHeader {
        &mut *(self.base.add(off) as *mut BlockHeader)
    }

    fn payload(&self, off: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.add(off + HEADER_SIZE)) }
    }

    /// Header offset for a payload pointer, or None if the pointer does not
    /// point into the arena.
    fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let base = self.base as usize;
        if addr < base + HEADER_SIZE || addr >= base + self.size {
            return None;
        }
        Some(addr - base - HEADER_SIZE)
    }

    /// Bytes to skip in front of `off`'s payload so it lands on `align`.
    /// A nonzero result always leaves room for a header plus a minimal
    /// payload, so the skipped front can stay on the list as a free block.
    fn padding_for(&self, off: usize, align: usize) -> usize {
        let payload = self.base as usize + off + HEADER_SIZE;
        let mut aligned = (payload + align - 1) & !(align - 1);
        while aligned != payload && aligned - payload < HEADER_SIZE + HEAP_ALIGN {
            aligned += align;
        }
        aligned - payload
    }
}

/// Variable-size kernel allocator over the fixed PMM-backed arena.
///
/// Constructed unclaimed so it can live in a static; [`KernelHeap::claim`]
/// hands it its arena during boot. Every operation before that fails with
/// the usual exhaustion sentinel.
pub struct KernelHeap {
    inner: Mutex<HeapArena>,
}

/// Backs `Box`, `Arc`, and the collection types on bare metal. Hosted
/// builds use the host allocator instead.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
pub static ALLOCATOR: KernelHeap = KernelHeap::empty();

impl KernelHeap {
    pub const fn empty() -> KernelHeap {
        KernelHeap {
            inner: Mutex::new(HeapArena::unclaimed()),
        }
    }

    /// Reserves the heap arena from the PMM and seeds it with one spanning
    /// free block. False if the PMM cannot supply the arena or the heap
    /// already claimed one.
    pub fn claim(&self, memory: &MemoryManager) -> bool {
        let mut arena = self.inner.lock();
        if !arena.base.is_null() {
            return false;
        }
        let Some(phys) = memory.alloc_pages(HEAP_PAGES) else {
            return false;
        };
        arena.base = memory.hhdm().ptr(phys);
        arena.size = HEAP_PAGES * FRAME_SIZE;
        unsafe {
            let head = arena.header(0);
            head.size = arena.size - HEADER_SIZE;
            head.next = NIL;
            head.free = true;
        }

        log::info!("kernel heap initialized: {} KiB", arena.size / 1024);
        true
    }

    /// Allocates `size` bytes, rounded up to 8-byte alignment, first fit.
    /// None for zero-size requests and on exhaustion.
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.kmalloc_aligned(size, HEAP_ALIGN)
    }

    /// Allocates `size` bytes whose payload starts on an `align` boundary;
    /// `align` must be a power of two. When the first fitting block's
    /// payload is misaligned, the block's front is carved off as a smaller
    /// free block and the allocation takes the aligned remainder. Splits
    /// the matched block when the tail slack can hold another block.
    pub fn kmalloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        // Oversized requests must fail cleanly, not wrap the rounding.
        let size = size.checked_add(HEAP_ALIGN - 1)? & !(HEAP_ALIGN - 1);
        let align = align.max(HEAP_ALIGN);

        let arena = self.inner.lock();
        if arena.base.is_null() || align > arena.size {
            return None;
        }
        let mut off = 0;
        loop {
            let block = unsafe { arena.header(off) };
            if block.free {
                let padding = arena.padding_for(off, align);
                if block.size >= size && block.size - size >= padding {
                    if padding > 0 {
                        let aoff = off + padding;
                        let carved = unsafe { arena.header(aoff) };
                        carved.size = block.size - padding;
                        carved.next = block.next;
                        carved.free = true;
                        block.size = padding - HEADER_SIZE;
                        block.next = aoff;
                        off = aoff;
                    }
                    let block = unsafe { arena.header(off) };
                    if block.size > size + HEADER_SIZE + HEAP_ALIGN {
                        let split_off = off + HEADER_SIZE + size;
                        let split = unsafe { arena.header(split_off) };
                        split.size = block.size - size - HEADER_SIZE;
                        split.next = block.next;
                        split.free = true;
                        block.size = size;
                        block.next = split_off;
                    }
                    block.free = false;
                    return Some(arena.payload(off));
                }
            }
            if block.next == NIL {
                break;
            }
            off = block.next;
        }

        log::warn!("kmalloc: no suitable block for {} bytes", size);
        None
    }

    /// Returns a block to the free list, merging with the following block
    /// when it is free, then scanning from the head for the predecessor and
    /// merging backward too. Freeing an already-free block is a no-op.
    pub fn kfree(&self, ptr: NonNull<u8>) {
        let arena = self.inner.lock();
        let Some(off) = arena.offset_of(ptr) else {
            log::warn!("kfree: {:p} not a heap pointer, ignored", ptr);
            return;
        };

        let block = unsafe { arena.header(off) };
        if block.free {
            return;
        }
        block.free = true;

        if block.next != NIL {
            let next = unsafe { arena.header(block.next) };
            if next.free {
                block.size += HEADER_SIZE + next.size;
                block.next = next.next;
            }
        }

        // The list is singly linked, so the predecessor takes a scan.
        if off != 0 {
            let mut cur = 0;
            loop {
                let c = unsafe { arena.header(cur) };
                if c.next == off {
                    if c.free {
                        c.size += HEADER_SIZE + block.size;
                        c.next = block.next;
                    }
                    break;
                }
                if c.next == NIL {
                    break;
                }
                cur = c.next;
            }
        }
    }

    /// Resizes an allocation. Grows in place only when the existing block
    /// already has room; otherwise allocates fresh, copies the payload, and
    /// frees the original. A zero `size` frees the block.
    pub fn krealloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            self.kfree(ptr);
            return None;
        }

        let old_size = {
            let arena = self.inner.lock();
            let off = arena.offset_of(ptr)?;
            unsafe { arena.header(off).size }
        };
        if old_size >= size {
            return Some(ptr);
        }

        let new = self.kmalloc(size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size);
        }
        self.kfree(ptr);
        Some(new)
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.kmalloc_aligned(layout.size(), layout.align()) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.kfree(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PhysArena;

    fn heap() -> (PhysArena, KernelHeap) {
        let arena = PhysArena::new(24 * 1024);
        let heap = KernelHeap::empty();
        assert!(heap.claim(&arena.memory()));
        (arena, heap)
    }

    fn assert_single_spanning_block(heap: &KernelHeap) {
        let arena = heap.inner.lock();
        let head = unsafe { arena.header(0) };
        assert!(head.free);
        assert_eq!(head.next, NIL);
        assert_eq!(head.size, arena.size - HEADER_SIZE);
    }

    #[test]
    fn zero_size_allocation_fails() {
        let (_arena, heap) = heap();
        assert!(heap.kmalloc(0).is_none());
    }

    #[test]
    fn unclaimed_heap_hands_out_nothing() {
        let heap = KernelHeap::empty();
        assert!(heap.kmalloc(8).is_none());
    }

    #[test]
    fn claim_is_once_only() {
        let arena = PhysArena::new(24 * 1024);
        let mm = arena.memory();
        let heap = KernelHeap::empty();
        assert!(heap.claim(&mm));
        assert!(!heap.claim(&mm));
    }

    #[test]
    fn first_fit_reuses_the_first_freed_block() {
        let (_arena, heap) = heap();

        let a = heap.kmalloc(100).unwrap();
        let _b = heap.kmalloc(50).unwrap();
        heap.kfree(a);

        // 60 bytes fit in the 104-byte hole at the front, so first fit must
        // land the allocation exactly where the first one was.
        let c = heap.kmalloc(60).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let (_arena, heap) = heap();

        let sizes = [1usize, 7, 8, 13, 100, 255, 4096];
        let mut live: std::vec::Vec<(usize, usize)> = std::vec::Vec::new();
        for &size in &sizes {
            let p = heap.kmalloc(size).unwrap();
            let addr = p.as_ptr() as usize;
            assert_eq!(addr % 8, 0);
            for &(base, len) in &live {
                assert!(addr + size <= base || base + len <= addr);
            }
            live.push((addr, size));
        }
    }

    #[test]
    fn aligned_allocation_lands_on_the_boundary() {
        let (_arena, heap) = heap();

        let small = heap.kmalloc(8).unwrap();
        let p = heap.kmalloc_aligned(100, 64).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);

        // The carved-off front and the tail both fold back in on free.
        heap.kfree(p);
        heap.kfree(small);
        assert_single_spanning_block(&heap);
    }

    #[test]
    fn global_alloc_path_honors_layout_alignment() {
        let (_arena, heap) = heap();

        let layout = Layout::from_size_align(256, 128).unwrap();
        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 128, 0);

        unsafe { heap.dealloc(p, layout) };
        assert_single_spanning_block(&heap);
    }

    #[test]
    fn freeing_everything_restores_one_spanning_block() {
        let (_arena, heap) = heap();

        let a = heap.kmalloc(100).unwrap();
        let b = heap.kmalloc(2000).unwrap();
        let c = heap.kmalloc(31).unwrap();
        let d = heap.kmalloc(512).unwrap();
        // Free out of order to exercise both coalescing directions.
        heap.kfree(b);
        heap.kfree(a);
        heap.kfree(d);
        heap.kfree(c);
        assert_single_spanning_block(&heap);
    }

    #[test]
    fn double_free_is_tolerated() {
        let (_arena, heap) = heap();

        let a = heap.kmalloc(64).unwrap();
        let b = heap.kmalloc(64).unwrap();
        heap.kfree(a);
        heap.kfree(a);
        heap.kfree(b);
        assert_single_spanning_block(&heap);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (_arena, heap) = heap();
        assert!(heap.kmalloc(usize::MAX / 2).is_none());
        // Sizes near the top of the address space must not wrap the
        // alignment rounding into a tiny request.
        assert!(heap.kmalloc(usize::MAX).is_none());
        assert!(heap.kmalloc(usize::MAX - 3).is_none());
        assert!(heap.kmalloc(usize::MAX - 7).is_none());

        let big = HEAP_PAGES * FRAME_SIZE - 2 * HEADER_SIZE;
        let p = heap.kmalloc(big).unwrap();
        assert!(heap.kmalloc(64).is_none());
        heap.kfree(p);
        assert!(heap.kmalloc(64).is_some());
    }

    #[test]
    fn krealloc_grows_in_place_when_possible() {
        let (_arena, heap) = heap();

        let p = heap.kmalloc(100).unwrap();
        // 100 rounds up to 104, so a request within that stays put.
        assert_eq!(heap.krealloc(p, 104), Some(p));
        assert_eq!(heap.krealloc(p, 50), Some(p));
    }

    #[test]
    fn krealloc_moves_and_preserves_payload() {
        let (_arena, heap) = heap();

        let p = heap.kmalloc(16).unwrap();
        let _wall = heap.kmalloc(16).unwrap();
        unsafe {
            for i in 0..16 {
                p.as_ptr().add(i).write(i as u8);
            }
        }

        let q = heap.krealloc(p, 4096).unwrap();
        assert_ne!(q, p);
        unsafe {
            for i in 0..16 {
                assert_eq!(q.as_ptr().add(i).read(), i as u8);
            }
        }
    }

    #[test]
    fn krealloc_zero_frees() {
        let (_arena, heap) = heap();

        let p = heap.kmalloc(128).unwrap();
        assert!(heap.krealloc(p, 0).is_none());
        assert_single_spanning_block(&heap);
    }
}
