//! Hosted-test fixtures: a simulated physical memory arena fed to the boot
//! path, and a recording context-switch stub standing in for the platform
//! register blit.

use crate::boot::{BootInfo, MemoryRegion};
use crate::kernel::Kernel;
use crate::memory::{bitmap_frame_allocator::BitmapFrameAllocator, HhdmOffset, MemoryManager};
use crate::sched::context::{Context, ContextSwitch};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::vec::Vec;

const PAGE: u64 = 4096;

/// A block of host memory posing as physical RAM. With an HHDM offset of
/// zero, "physical" addresses inside it are directly dereferenceable, so
/// the real PMM/VMM/heap code paths run unmodified.
pub struct PhysArena {
    _buf: Vec<u8>,
    regions: Vec<MemoryRegion>,
    hole: Option<(u64, u64)>,
}

impl PhysArena {
    pub fn new(pages: usize) -> PhysArena {
        let buf = vec![0u8; (pages + 1) * PAGE as usize];
        let base = (buf.as_ptr() as u64 + PAGE - 1) & !(PAGE - 1);
        let regions = vec![MemoryRegion::usable(base, pages as u64 * PAGE)];
        PhysArena {
            _buf: buf,
            regions,
            hole: None,
        }
    }

    /// Two usable ranges separated by a reserved hole.
    pub fn with_hole(front: usize, hole: usize, back: usize) -> PhysArena {
        let total = front + hole + back;
        let buf = vec![0u8; (total + 1) * PAGE as usize];
        let base = (buf.as_ptr() as u64 + PAGE - 1) & !(PAGE - 1);
        let hole_base = base + front as u64 * PAGE;
        let back_base = hole_base + hole as u64 * PAGE;
        let regions = vec![
            MemoryRegion::usable(base, front as u64 * PAGE),
            MemoryRegion::reserved(hole_base, hole as u64 * PAGE),
            MemoryRegion::usable(back_base, back as u64 * PAGE),
        ];
        PhysArena {
            _buf: buf,
            regions,
            hole: Some((hole_base, hole as u64 * PAGE)),
        }
    }

    pub fn hole(&self) -> Option<(u64, u64)> {
        self.hole
    }

    pub fn boot_info(&self) -> BootInfo<'_> {
        BootInfo {
            memory_map: &self.regions,
            hhdm_offset: 0,
        }
    }

    pub fn pmm(&self) -> spin::Mutex<BitmapFrameAllocator> {
        spin::Mutex::new(unsafe { BitmapFrameAllocator::init(&self.regions, HhdmOffset::new(0)) })
    }

    pub fn memory(&self) -> MemoryManager {
        MemoryManager::init(&self.boot_info())
    }

    pub fn kernel(&self) -> (Kernel, Arc<StubSwitch>) {
        let stub = Arc::new(StubSwitch::default());
        let kernel = Kernel::new(&self.boot_info(), stub.clone());
        (kernel, stub)
    }
}

/// Records scheduler hand-offs instead of blitting registers. Hosted tests
/// observe scheduling decisions through it; control flow simply continues
/// in the caller.
#[derive(Default)]
pub struct StubSwitch {
    pub switches: AtomicUsize,
    pub last_kernel_stack: AtomicU64,
}

impl ContextSwitch for StubSwitch {
    fn set_kernel_stack(&self, stack_top: u64) {
        self.last_kernel_stack.store(stack_top, Ordering::SeqCst);
    }

    unsafe fn switch(&self, _prev: *mut Context, _next: *const Context) {
        self.switches.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn enter_user(&self, _entry: u64, _user_stack_top: u64) -> ! {
        unreachable!("no user privilege level on the host")
    }
}
