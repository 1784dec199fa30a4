//! Code addresses the engine traps on but never runs.

/// Every thread's function returns here. The address always carries a
/// breakpoint, so reaching the body means the breakpoint was lost.
#[inline(never)]
pub extern "C" fn thread_exit_marker() -> ! {
    std::process::abort()
}

/// Intercepted calls resume here instead of running the real function; the
/// `ret` goes back to the caller with the return value already in place.
#[inline(never)]
pub extern "C" fn intercepted_return() {
    // Keeps the body distinct so the function is never merged with another
    // empty one. Touches neither memory nor the return register.
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("nop", "nop", "nop", options(nomem, nostack, preserves_flags));
    }
}

pub fn exit_marker_address() -> u64 {
    thread_exit_marker as usize as u64
}

pub fn return_stub_address() -> u64 {
    intercepted_return as usize as u64
}
