//! Saved execution contexts and the switch primitive.
//!
//! The scheduler treats a context as an opaque value: it primes one when a
//! task is created and hands pairs of them to a [`ContextSwitch`]
//! implementation when control moves between tasks. The register blit
//! itself is platform assembly supplied by the embedder, exactly like the
//! interrupt stubs.

use core::fmt;

/// RFLAGS with the interrupt-enable bit set, the state every new task
/// starts in.
pub const DEFAULT_RFLAGS: u64 = 0x202;

/// Callee-saved register file plus entry arguments, saved across a switch.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    // First dispatch enters a trampoline; these carry its arguments.
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
}

impl Context {
    /// Context whose first dispatch calls `trampoline(arg0, arg1, arg2)` on
    /// `stack_top`.
    pub fn prime(trampoline: u64, arg0: u64, arg1: u64, arg2: u64, stack_top: u64) -> Context {
        // System V wants 16-byte alignment at the call boundary.
        let stack_top = stack_top & !0xF;
        Context {
            rip: trampoline,
            rsp: stack_top,
            rbp: stack_top,
            rflags: DEFAULT_RFLAGS,
            rdi: arg0,
            rsi: arg1,
            rdx: arg2,
            ..Context::default()
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("rip", &format_args!("{:#016x}", self.rip))
            .field("rsp", &format_args!("{:#016x}", self.rsp))
            .field("rbp", &format_args!("{:#016x}", self.rbp))
            .field("rbx", &format_args!("{:#016x}", self.rbx))
            .field("r12", &format_args!("{:#016x}", self.r12))
            .field("r13", &format_args!("{:#016x}", self.r13))
            .field("r14", &format_args!("{:#016x}", self.r14))
            .field("r15", &format_args!("{:#016x}", self.r15))
            .field("rflags", &format_args!("{:#016x}", self.rflags))
            .finish()
    }
}

/// Platform hook the scheduler switches tasks through.
pub trait ContextSwitch: Send + Sync {
    /// Point the privileged stack (TSS RSP0 on x86_64) at the incoming
    /// task's kernel stack top before control moves.
    fn set_kernel_stack(&self, stack_top: u64);

    /// Save the running register file into `prev` and resume `next`. The
    /// call returns only when the previous task is scheduled again.
    ///
    /// # Safety
    ///
    /// Both pointers must refer to live, pinned [`Context`] values, and
    /// `next` must have been primed or previously saved by this primitive.
    unsafe fn switch(&self, prev: *mut Context, next: *const Context);

    /// Drop to user privilege and begin executing `entry` on
    /// `user_stack_top`. Never returns; the task leaves through the exit
    /// syscall path.
    ///
    /// # Safety
    ///
    /// `entry` must be a valid user entry point and `user_stack_top` the
    /// top of a mapped, user-accessible stack.
    unsafe fn enter_user(&self, entry: u64, user_stack_top: u64) -> !;
}
