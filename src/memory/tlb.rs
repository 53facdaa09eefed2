//! Translation cache invalidation.
//!
//! Mapping changes invalidate only the one affected address. Hosted builds
//! have no TLB, so the call compiles to nothing there.

use x86_64::VirtAddr;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn flush(vaddr: VirtAddr) {
    x86_64::instructions::tlb::flush(vaddr);
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn flush(_vaddr: VirtAddr) {}
