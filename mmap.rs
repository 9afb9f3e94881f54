//! Thin wrappers over `mmap(2)`, `mprotect(2)` and `munmap(2)`.
//!
//! All addresses and lengths are plain integers and must already be page
//! aligned. The functions return `std::io::Error` so callers can attach the
//! loader-level context (`SegmentMapFailed`, `PageBackingFailed`).
//!
//! These functions do not allocate or log, so the fault resolver can call
//! them from signal context.

use std::io;
use std::os::fd::RawFd;

/// Where a mapping may be placed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Let the kernel choose; the address is ignored.
    Anywhere,
    /// Use the address as a hint and fail if the kernel picks another one.
    Natural,
    /// `MAP_FIXED`: replace whatever is mapped at the address.
    Fixed,
}

impl Placement {
    fn flags(self) -> libc::c_int {
        match self {
            Placement::Anywhere | Placement::Natural => 0,
            Placement::Fixed => libc::MAP_FIXED,
        }
    }

    fn hint(self, addr: u64) -> *mut libc::c_void {
        match self {
            Placement::Anywhere => std::ptr::null_mut(),
            Placement::Natural | Placement::Fixed => addr as *mut libc::c_void,
        }
    }
}

/// The one `mmap(2)` call every mapping goes through.
fn map(
    addr: u64,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    placement: Placement,
    fd: RawFd,
    offset: u64,
) -> io::Result<u64> {
    let ret = unsafe {
        libc::mmap(
            placement.hint(addr),
            len,
            prot,
            libc::MAP_PRIVATE | flags | placement.flags(),
            fd,
            offset as libc::off_t,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let mapped = ret as u64;
    if placement == Placement::Natural && mapped != addr {
        unsafe {
            libc::munmap(ret, len);
        }
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }
    Ok(mapped)
}

/// Map `len` bytes of `fd` starting at `offset` privately at `addr`.
pub fn map_file(
    addr: u64,
    len: usize,
    prot: libc::c_int,
    placement: Placement,
    fd: RawFd,
    offset: u64,
) -> io::Result<u64> {
    map(addr, len, prot, 0, placement, fd, offset)
}

/// Map `len` bytes of zero-filled anonymous memory at `addr`.
pub fn map_anonymous(
    addr: u64,
    len: usize,
    prot: libc::c_int,
    placement: Placement,
) -> io::Result<u64> {
    map(addr, len, prot, libc::MAP_ANONYMOUS, placement, -1, 0)
}

/// Claim `[addr, addr + len)` without backing it; any access faults.
pub fn reserve(addr: u64, len: usize, placement: Placement) -> io::Result<u64> {
    map(
        addr,
        len,
        libc::PROT_NONE,
        libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        placement,
        -1,
        0,
    )
}

/// Allocate a stack of `len` bytes wherever the kernel sees fit.
pub fn map_stack(len: usize) -> io::Result<u64> {
    map(
        0,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_ANONYMOUS | libc::MAP_STACK,
        Placement::Anywhere,
        -1,
        0,
    )
}

pub fn protect(addr: u64, len: usize, prot: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn unmap(addr: u64, len: usize) -> io::Result<()> {
    let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Zero `len` bytes at `addr`.
///
/// # Safety
///
/// The range must be mapped writable and must not alias live Rust objects.
pub unsafe fn zero(addr: u64, len: usize) {
    unsafe {
        std::ptr::write_bytes(addr as *mut u8, 0, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;

    #[test]
    fn reserve_then_back_one_page() {
        let len = 4 * PAGE_SIZE as usize;
        let base = reserve(0, len, Placement::Anywhere).unwrap();
        let page = base + PAGE_SIZE;
        let got = map_anonymous(
            page,
            PAGE_SIZE as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            Placement::Fixed,
        )
        .unwrap();
        assert_eq!(got, page);
        unsafe {
            *(page as *mut u8) = 0xaa;
            zero(page, PAGE_SIZE as usize);
            assert_eq!(*(page as *const u8), 0);
        }
        protect(page, PAGE_SIZE as usize, libc::PROT_READ).unwrap();
        unmap(base, len).unwrap();
    }

    #[test]
    fn natural_placement_rejects_relocation() {
        let len = PAGE_SIZE as usize;
        let taken = map_anonymous(0, len, libc::PROT_READ, Placement::Anywhere).unwrap();
        let err = map_anonymous(taken, len, libc::PROT_READ, Placement::Natural).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        unmap(taken, len).unwrap();
    }
}
