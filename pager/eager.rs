use crate::elf::Segment;
use crate::image::BinaryImage;
use crate::mmap::{self, Placement};
use crate::page::{page_align, page_offset};
use crate::pager::{LoadInfo, SegmentMapper, load_info, placement_for};
use crate::{Error, Result};
use std::os::fd::{AsRawFd, RawFd};
use tracing::debug;

/// Maps every loadable segment in full at load time.
#[derive(Copy, Clone, Debug, Default)]
pub struct EagerMapper;

impl SegmentMapper for EagerMapper {
    fn map_segments(&self, image: &BinaryImage) -> Result<LoadInfo> {
        let fd = image.file.as_raw_fd();
        for (index, segment) in image.segments.iter().enumerate() {
            map_segment(fd, segment, placement_for(index))?;
        }
        Ok(load_info(image))
    }
}

/// Map one segment: its file-backed pages, then the anonymous pages of its
/// BSS. The tail of the last file-backed page past `filesz` is zeroed.
pub fn map_segment(fd: RawFd, segment: &Segment, placement: Placement) -> Result<()> {
    let start = segment.page_start();
    let file_len = segment.file_map_size();
    let end = segment.page_end();
    let prot = segment.prot();

    debug!(
        "Loading segment at 0x{:016x} ({} bytes, {} from file) prot={:x}",
        segment.vaddr, segment.memsz, segment.filesz, prot
    );

    let mut bss_placement = placement;
    if file_len > 0 {
        let bss_start = segment.bss_start();
        let partial_page = segment.has_bss() && page_offset(bss_start) != 0;
        let map_prot = if partial_page {
            prot | libc::PROT_WRITE
        } else {
            prot
        };
        mmap::map_file(
            start,
            file_len as usize,
            map_prot,
            placement,
            fd,
            segment.page_file_offset(),
        )
        .map_err(|source| Error::SegmentMapFailed {
            addr: start,
            source,
        })?;

        if partial_page {
            unsafe {
                mmap::zero(bss_start, (page_align(bss_start) - bss_start) as usize);
            }
            if map_prot != prot {
                mmap::protect(start, file_len as usize, prot).map_err(|source| {
                    Error::SegmentMapFailed {
                        addr: start,
                        source,
                    }
                })?;
            }
        }
        bss_placement = Placement::Fixed;
    }

    let bss_map_start = start + file_len;
    if segment.has_bss() && end > bss_map_start {
        debug!(
            "Mapping BSS 0x{:016x}-0x{:016x}",
            bss_map_start, end
        );
        mmap::map_anonymous(
            bss_map_start,
            (end - bss_map_start) as usize,
            prot,
            bss_placement,
        )
        .map_err(|source| Error::SegmentMapFailed {
            addr: bss_map_start,
            source,
        })?;
    }
    Ok(())
}
