//! Monolithic kernel core: physical page allocator, four-level virtual
//! memory, kernel heap, and a preemptive round-robin task scheduler, tied
//! together by an explicitly constructed [`Kernel`] context.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod boot;
pub mod constants;
pub mod critical;
pub mod kernel;
pub mod memory;
pub mod sched;

#[cfg(test)]
mod testing;

pub use boot::{BootInfo, MemoryRegion, MemoryRegionKind};
pub use kernel::Kernel;
