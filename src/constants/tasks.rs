/// Kernel and user stacks are both two pages.
pub const TASK_STACK_SIZE: usize = 8192;

/// Timer ticks a task may run before preemption.
pub const TIME_SLICE: u64 = 4;

/// Task names are capped at 63 bytes plus the implicit terminator slot.
pub const TASK_NAME_LEN: usize = 64;

/// Base of the user-stack windows. Each task gets a private stride-aligned
/// region below this area's top so two live tasks never share stack pages.
pub const USER_STACKS_START: u64 = 0x7000_0000_0000;

/// Distance between consecutive tasks' user-stack windows. One guard page
/// past the stack keeps overruns from walking into the neighbor.
pub const USER_STACK_STRIDE: u64 = (TASK_STACK_SIZE + 4096) as u64;
