//! Demand paging.
//!
//! [`DemandMapper`] reserves each segment's pages as `PROT_NONE` and hands a
//! [`DemandPager`] to the fault handler. Every first touch of a reserved page
//! raises SIGSEGV; the pager then backs exactly that page from the file or
//! with zeroes and the faulting instruction is restarted.
//!
//! The pager runs in signal context after the loaded program owns the thread,
//! so it must not allocate, log or touch thread-locals. Everything it needs
//! (the segment table, a file descriptor and the per-page bitmaps) is built
//! before handoff.

use crate::elf::{Segment, SegmentTable};
use crate::fault::{self, FaultEvent, FaultKind, PageFaultHandler};
use crate::image::BinaryImage;
use crate::mmap::{self, Placement};
use crate::page::{PAGE_SIZE, page_align, page_start};
use crate::pager::{LoadInfo, SegmentMapper, load_info, placement_for};
use crate::{Error, Result};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// How a faulting page gets its contents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PagePlan {
    /// The whole page comes from the file at `offset`.
    File { offset: u64 },
    /// The head comes from the file; `[zero_from, page end)` is BSS.
    Mixed { offset: u64, zero_from: u64 },
    /// Pure BSS: a fresh zero page.
    Zero,
}

/// Classify `page` (page aligned) of `segment`.
pub fn plan_page(segment: &Segment, page: u64) -> PagePlan {
    let bss_start = segment.bss_start();
    if segment.filesz == 0 || page >= page_align(bss_start) {
        return PagePlan::Zero;
    }
    let offset = segment.page_file_offset() + (page - segment.page_start());
    if segment.has_bss() && page < bss_start && bss_start < page + PAGE_SIZE {
        PagePlan::Mixed {
            offset,
            zero_from: bss_start,
        }
    } else {
        PagePlan::File { offset }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Backed(PagePlan),
    /// The page was backed by an earlier fault; nothing was remapped.
    AlreadyBacked,
}

/// One bit per page of a segment.
struct PageBitmap {
    words: Box<[AtomicU64]>,
}

impl PageBitmap {
    fn new(pages: usize) -> Self {
        Self {
            words: (0..pages.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / 64].load(Ordering::Acquire) & (1 << (index % 64)) != 0
    }

    fn set(&self, index: usize) {
        self.words[index / 64].fetch_or(1 << (index % 64), Ordering::AcqRel);
    }
}

/// Backs pages of a reserved executable image on demand.
pub struct DemandPager {
    file: File,
    segments: SegmentTable,
    backed: Vec<PageBitmap>,
}

impl DemandPager {
    pub fn new(file: File, segments: SegmentTable) -> Self {
        let backed = segments
            .iter()
            .map(|s| PageBitmap::new(((s.page_end() - s.page_start()) / PAGE_SIZE) as usize))
            .collect();
        Self {
            file,
            segments,
            backed,
        }
    }

    /// Whether the page containing `addr` has been backed.
    pub fn is_backed(&self, addr: u64) -> bool {
        match self.segments.find(addr) {
            Some((index, segment)) => self.backed[index].is_set(page_index(segment, addr)),
            None => false,
        }
    }

    /// Back the page that `event` faulted on.
    pub fn resolve(&self, event: FaultEvent) -> Result<Resolution> {
        let addr = event.addr;
        let Some((index, segment)) = self.segments.find(addr) else {
            return Err(match event.kind {
                FaultKind::Unmapped => Error::NoOwningSegment(addr),
                kind => Error::UnexpectedFaultKind {
                    addr,
                    code: kind.code(),
                },
            });
        };

        let slot = page_index(segment, addr);
        let bitmap = &self.backed[index];
        if bitmap.is_set(slot) {
            // A protection fault on a page we already backed is the
            // program's own access violation.
            return match event.kind {
                FaultKind::Unmapped => Ok(Resolution::AlreadyBacked),
                kind => Err(Error::UnexpectedFaultKind {
                    addr,
                    code: kind.code(),
                }),
            };
        }
        if let FaultKind::Other(code) = event.kind {
            return Err(Error::UnexpectedFaultKind { addr, code });
        }

        let page = page_start(addr);
        let plan = plan_page(segment, page);
        back_page(self.file.as_raw_fd(), segment, page, plan)
            .map_err(|source| Error::PageBackingFailed { addr: page, source })?;
        bitmap.set(slot);
        Ok(Resolution::Backed(plan))
    }
}

impl PageFaultHandler for DemandPager {
    fn handle(&self, event: FaultEvent) -> Result<()> {
        self.resolve(event).map(|_| ())
    }
}

fn page_index(segment: &Segment, addr: u64) -> usize {
    ((page_start(addr) - segment.page_start()) / PAGE_SIZE) as usize
}

/// Install the single mapping for `page`.
fn back_page(fd: RawFd, segment: &Segment, page: u64, plan: PagePlan) -> io::Result<()> {
    let prot = segment.prot();
    let len = PAGE_SIZE as usize;
    match plan {
        PagePlan::File { offset } => {
            mmap::map_file(page, len, prot, Placement::Fixed, fd, offset)?;
            return Ok(());
        }
        PagePlan::Mixed { offset, zero_from } => {
            mmap::map_file(
                page,
                len,
                prot | libc::PROT_WRITE,
                Placement::Fixed,
                fd,
                offset,
            )?;
            unsafe {
                mmap::zero(zero_from, (page + PAGE_SIZE - zero_from) as usize);
            }
        }
        PagePlan::Zero => {
            mmap::map_anonymous(page, len, prot | libc::PROT_WRITE, Placement::Fixed)?;
            unsafe {
                mmap::zero(page, len);
            }
        }
    }
    if prot & libc::PROT_WRITE == 0 {
        mmap::protect(page, len, prot)?;
    }
    Ok(())
}

/// Reserves segments and defers their backing to a [`DemandPager`].
#[derive(Copy, Clone, Debug, Default)]
pub struct DemandMapper;

impl DemandMapper {
    /// Reserve the page range of every segment without backing it.
    pub fn reserve_segments(segments: &SegmentTable) -> Result<()> {
        for (index, segment) in segments.iter().enumerate() {
            let start = segment.page_start();
            let end = segment.page_end();
            if end == start {
                continue;
            }
            debug!(
                "Reserving segment 0x{:016x}-0x{:016x} prot={:x}",
                start,
                end,
                segment.prot()
            );
            mmap::reserve(start, (end - start) as usize, placement_for(index))
                .map_err(|source| Error::SegmentMapFailed {
                    addr: start,
                    source,
                })?;
        }
        Ok(())
    }
}

impl SegmentMapper for DemandMapper {
    fn map_segments(&self, image: &BinaryImage) -> Result<LoadInfo> {
        Self::reserve_segments(&image.segments)?;

        // Faults read from the file for the rest of the process lifetime.
        let pager = DemandPager::new(image.file.try_clone()?, image.segments.clone());
        let pager: &'static DemandPager = Box::leak(Box::new(pager));
        fault::install(pager)?;

        Ok(load_info(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::elf::program_header::{PF_R, PF_W};

    fn data_segment() -> Segment {
        // .data ends 0x100 bytes into its second page, .bss runs two pages on.
        Segment {
            vaddr: 0x601000,
            offset: 0x1000,
            filesz: 0x1100,
            memsz: 0x3000,
            flags: PF_R | PF_W,
        }
    }

    #[test]
    fn file_page() {
        assert_eq!(
            plan_page(&data_segment(), 0x601000),
            PagePlan::File { offset: 0x1000 }
        );
    }

    #[test]
    fn mixed_page() {
        assert_eq!(
            plan_page(&data_segment(), 0x602000),
            PagePlan::Mixed {
                offset: 0x2000,
                zero_from: 0x602100
            }
        );
    }

    #[test]
    fn bss_page() {
        assert_eq!(plan_page(&data_segment(), 0x603000), PagePlan::Zero);
    }

    #[test]
    fn unaligned_segment_offsets_follow_page_start() {
        let segment = Segment {
            vaddr: 0x403e10,
            offset: 0x2e10,
            filesz: 0x1f0,
            memsz: 0x1f0,
            flags: PF_R,
        };
        assert_eq!(
            plan_page(&segment, 0x403000),
            PagePlan::File { offset: 0x2000 }
        );
    }

    #[test]
    fn file_tail_without_bss_is_not_zeroed() {
        let mut segment = data_segment();
        segment.memsz = segment.filesz;
        assert_eq!(
            plan_page(&segment, 0x602000),
            PagePlan::File { offset: 0x2000 }
        );
    }

    #[test]
    fn pure_bss_segment() {
        let segment = Segment {
            vaddr: 0x700000,
            offset: 0,
            filesz: 0,
            memsz: 0x1000,
            flags: PF_R | PF_W,
        };
        assert_eq!(plan_page(&segment, 0x700000), PagePlan::Zero);
    }

    #[test]
    fn bitmap_tracks_pages() {
        let bitmap = PageBitmap::new(130);
        assert!(!bitmap.is_set(129));
        bitmap.set(129);
        bitmap.set(3);
        assert!(bitmap.is_set(129));
        assert!(bitmap.is_set(3));
        assert!(!bitmap.is_set(64));
    }
}
