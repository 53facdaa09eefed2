//! Interrupt-disabled critical sections.
//!
//! The scheduler ring is mutated from the timer interrupt, so its critical
//! sections run with interrupts masked rather than behind a spin lock a
//! handler could self-deadlock on. Hosted builds have no interrupt flag to
//! mask; there the guard is just the closure call.

/// Runs `f` with interrupts disabled, restoring the previous interrupt
/// state afterwards.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}
