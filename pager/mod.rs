//! Segment mapping strategies.
//!
//! Both strategies walk the segment table in program-header order and share
//! the same address arithmetic. The first loadable segment is placed at its
//! natural address; every later one is mapped with `MAP_FIXED`, because the
//! segments of one executable are laid out relative to each other.
//!
//! - [`EagerMapper`] backs every page before handoff.
//! - [`DemandMapper`] reserves address space and registers a
//!   [`DemandPager`] that backs pages from the SIGSEGV handler.

pub mod demand;
pub mod eager;

pub use demand::{DemandMapper, DemandPager, PagePlan, Resolution, plan_page};
pub use eager::EagerMapper;

use crate::image::BinaryImage;
use crate::mmap::Placement;
use crate::Result;
use tracing::warn;

/// Addresses the stack builder needs from the mapping step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadInfo {
    pub entry: u64,
    /// Virtual address of the program-header table (`AT_PHDR`), zero if no
    /// segment maps it.
    pub phdr_addr: u64,
    pub phnum: u64,
    pub phentsize: u64,
}

/// A way of establishing an executable's memory image.
pub trait SegmentMapper {
    fn map_segments(&self, image: &BinaryImage) -> Result<LoadInfo>;
}

pub(crate) fn placement_for(index: usize) -> Placement {
    if index == 0 {
        Placement::Natural
    } else {
        Placement::Fixed
    }
}

pub(crate) fn load_info(image: &BinaryImage) -> LoadInfo {
    let phdr_addr = image.segments.phdr_addr(image.header.phoff).unwrap_or_else(|| {
        warn!(
            "program headers at file offset {:#x} are not part of any loadable segment",
            image.header.phoff
        );
        0
    });
    LoadInfo {
        entry: image.header.entry,
        phdr_addr,
        phnum: image.program_headers.len() as u64,
        phentsize: image.header.phentsize as u64,
    }
}
