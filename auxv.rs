//! Auxiliary vector entries (kernel-userland ABI).
//!
//! The kernel hands every process an auxiliary vector just above its envp
//! array. The loader reads its own vector from `/proc/self/auxv`, passes most
//! entries through to the loaded program and rewrites the program-specific
//! ones (see [`crate::stack`]).

use std::io;

pub use libc::{
    AT_BASE, AT_ENTRY, AT_EXECFN, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM, AT_PLATFORM,
    AT_RANDOM,
};

/// Size of one encoded entry: two native words.
pub const AUXV_ENTRY_SIZE: usize = 16;

/// Auxiliary vector entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuxEntry {
    pub a_type: u64,
    pub a_val: u64,
}

impl AuxEntry {
    pub const fn new(a_type: u64, a_val: u64) -> Self {
        Self { a_type, a_val }
    }
}

/// Decode a raw auxiliary vector, stopping at `AT_NULL`.
///
/// The terminator is not included in the result; a trailing partial entry is
/// ignored.
pub fn parse(bytes: &[u8]) -> Vec<AuxEntry> {
    let mut entries = Vec::new();
    for chunk in bytes.chunks_exact(AUXV_ENTRY_SIZE) {
        let (a_type, a_val) = chunk.split_at(8);
        let a_type = u64::from_ne_bytes(a_type.try_into().unwrap_or_default());
        let a_val = u64::from_ne_bytes(a_val.try_into().unwrap_or_default());
        if a_type == AT_NULL {
            break;
        }
        entries.push(AuxEntry::new(a_type, a_val));
    }
    entries
}

/// The loader's own auxiliary vector.
pub fn read_host() -> io::Result<Vec<AuxEntry>> {
    let bytes = std::fs::read("/proc/self/auxv")?;
    Ok(parse(&bytes))
}

/// Seed for the AT_RANDOM generator: the first eight of the 16 random bytes
/// the kernel gave this process.
pub fn host_random_seed() -> Option<u64> {
    let ptr = unsafe { libc::getauxval(AT_RANDOM) } as *const u8;
    if ptr.is_null() {
        return None;
    }
    let mut bytes = [0u8; 8];
    unsafe {
        std::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), bytes.len());
    }
    Some(u64::from_ne_bytes(bytes))
}
