//! x86-64 process handoff.

use core::arch::asm;

/// Value of `AT_PLATFORM` for programs started on this architecture.
pub const PLATFORM: &str = "x86_64";

/// Switch to the new stack and jump to `entry`. Never returns.
///
/// Every general-purpose register is cleared. In particular `rdx` must be
/// zero: the C runtime treats a non-zero `rdx` as a function pointer the
/// dynamic linker wants registered with `atexit`.
///
/// # Safety
///
/// `sp` must point at a complete initial stack image and `entry` at mapped
/// (or demand-paged) code of the loaded program. Nothing of the calling Rust
/// program may be used afterwards.
pub unsafe fn enter(sp: u64, entry: u64) -> ! {
    unsafe {
        asm!(
            "mov rsp, rdi",
            "push rsi",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "xor r8d, r8d",
            "xor r9d, r9d",
            "xor r10d, r10d",
            "xor r11d, r11d",
            "xor r12d, r12d",
            "xor r13d, r13d",
            "xor r14d, r14d",
            "xor r15d, r15d",
            "ret",
            in("rdi") sp,
            in("rsi") entry,
            options(noreturn)
        )
    }
}
