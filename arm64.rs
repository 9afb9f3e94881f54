//! AArch64 process handoff.

use core::arch::asm;

/// Value of `AT_PLATFORM` for programs started on this architecture.
pub const PLATFORM: &str = "aarch64";

/// Switch to the new stack and branch to `entry`. Never returns.
///
/// Every general-purpose register except the branch target is cleared; `x0`
/// must be zero because the C runtime treats it as the dynamic linker's
/// finalizer.
///
/// # Safety
///
/// `sp` must point at a complete initial stack image and `entry` at mapped
/// (or demand-paged) code of the loaded program. Nothing of the calling Rust
/// program may be used afterwards.
pub unsafe fn enter(sp: u64, entry: u64) -> ! {
    unsafe {
        asm!(
            "mov sp, x0",
            "mov x0, xzr",
            "mov x1, xzr",
            "mov x2, xzr",
            "mov x3, xzr",
            "mov x4, xzr",
            "mov x5, xzr",
            "mov x6, xzr",
            "mov x7, xzr",
            "mov x8, xzr",
            "mov x9, xzr",
            "mov x10, xzr",
            "mov x11, xzr",
            "mov x12, xzr",
            "mov x13, xzr",
            "mov x14, xzr",
            "mov x15, xzr",
            "mov x17, xzr",
            "mov x18, xzr",
            "mov x19, xzr",
            "mov x20, xzr",
            "mov x21, xzr",
            "mov x22, xzr",
            "mov x23, xzr",
            "mov x24, xzr",
            "mov x25, xzr",
            "mov x26, xzr",
            "mov x27, xzr",
            "mov x28, xzr",
            "mov x29, xzr",
            "mov x30, xzr",
            "br x16",
            in("x0") sp,
            in("x16") entry,
            options(noreturn)
        )
    }
}
