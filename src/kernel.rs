//! The kernel context object.
//!
//! One `Kernel` owns every core resource: the physical page allocator and
//! shared page tables, the kernel heap, and the scheduler. It is built
//! explicitly from the boot handoff instead of living in ambient statics,
//! and its lifetime is the running kernel's lifetime.

use crate::boot::BootInfo;
use crate::memory::{heap::KernelHeap, MemoryManager};
use crate::sched::{context::ContextSwitch, Scheduler};
use alloc::sync::Arc;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
use alloc::boxed::Box;

pub struct Kernel {
    pub memory: Arc<MemoryManager>,
    pub heap: &'static KernelHeap,
    pub sched: Arc<Scheduler>,
}

impl Kernel {
    /// Brings the core up: PMM (fatal below the boot minimum), kernel page
    /// directory, heap arena, scheduler. The platform supplies the memory
    /// map and the context-switch primitive.
    pub fn new(boot: &BootInfo, port: Arc<dyn ContextSwitch>) -> Kernel {
        let memory = MemoryManager::init(boot);
        // The heap backs the Arcs below, so it comes up first.
        let heap = Self::claim_heap(&memory);
        let memory = Arc::new(memory);
        let sched = Arc::new(Scheduler::new(Arc::clone(&memory), heap, port));

        log::info!(
            "kernel core up, {} MiB of {} MiB free",
            memory.free_memory() / (1024 * 1024),
            memory.total_memory() / (1024 * 1024)
        );
        Kernel {
            memory,
            heap,
            sched,
        }
    }

    /// On bare metal the heap is the global allocator static; claiming its
    /// arena makes the `alloc` types usable.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn claim_heap(memory: &MemoryManager) -> &'static KernelHeap {
        let heap = &crate::memory::heap::ALLOCATOR;
        assert!(heap.claim(memory), "failed to reserve the kernel heap arena");
        heap
    }

    /// Hosted builds allocate through the host, so each kernel instance
    /// gets its own leaked heap instead of sharing one static.
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    fn claim_heap(memory: &MemoryManager) -> &'static KernelHeap {
        let heap = Box::leak(Box::new(KernelHeap::empty()));
        assert!(heap.claim(memory), "failed to reserve the kernel heap arena");
        heap
    }
}

#[cfg(test)]
mod tests {
    use crate::constants::memory::{FRAME_SIZE, HEAP_PAGES};
    use crate::testing::PhysArena;

    #[test]
    fn boot_reserves_heap_and_page_directory() {
        let arena = PhysArena::new(32 * 1024);
        let (kernel, _stub) = arena.kernel();

        let total = kernel.memory.total_memory();
        let free = kernel.memory.free_memory();
        // Heap arena, kernel root table, and the bitmap itself are spoken
        // for already.
        assert!(total - free >= (HEAP_PAGES * FRAME_SIZE) as u64);
        assert!(kernel.heap.kmalloc(1024).is_some());
        assert_eq!(kernel.sched.current(), None);
    }
}
