//! Page alignment arithmetic.
//!
//! Loadable segments are mapped at page granularity, while their virtual
//! addresses and sizes are byte-granular. These helpers convert between the
//! two. Only 4 KiB pages are supported.

pub const PAGE_SIZE: u64 = 4096;

const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Round `addr` down to the start of its page.
#[inline]
pub const fn page_start(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round `addr` up to the next page boundary.
#[inline]
pub const fn page_align(addr: u64) -> u64 {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Offset of `addr` within its page.
#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & PAGE_MASK
}

#[inline]
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_start(0x401234), 0x401000);
        assert_eq!(page_align(0x401234), 0x402000);
        assert_eq!(page_align(0x402000), 0x402000);
        assert_eq!(page_offset(0x401234), 0x234);
        assert_eq!(align_down(0x7fff_1239, 16), 0x7fff_1230);
    }

    #[test]
    fn containment() {
        for (vaddr, memsz) in [(0x400000, 0x1000), (0x403e10, 0x2f0), (0x1001, 1), (0, 0)] {
            assert!(page_start(vaddr) <= vaddr);
            assert!(page_align(vaddr + memsz) >= vaddr + memsz);
        }
    }
}
