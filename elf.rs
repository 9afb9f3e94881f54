//! ELF header and program-header reading.
//!
//! The reader uses positioned reads on the executable's file handle, so it
//! never depends on (or disturbs) a shared file cursor. Parsing of the raw
//! bytes is delegated to `goblin`.

use crate::page::{PAGE_SIZE, page_align, page_offset, page_start};
use crate::{Error, Result};
use goblin::container::Ctx;
use goblin::elf::Elf;
use goblin::elf::header::{EI_CLASS, ELFCLASS64, ELFMAG, ET_EXEC, SELFMAG};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_INTERP, PT_LOAD, ProgramHeader};
use goblin::elf64::header::SIZEOF_EHDR;
use goblin::elf64::program_header::SIZEOF_PHDR;
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::debug;

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = goblin::elf::header::EM_X86_64;

#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = goblin::elf::header::EM_AARCH64;

/// The fields of the ELF file header the loader needs.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phnum: u16,
    pub phentsize: u16,
    pub machine: u16,
    pub e_type: u16,
    /// Container and byte order the program headers are encoded with.
    ctx: Ctx,
}

/// A loadable (PT_LOAD) segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    /// Raw `p_flags` (`PF_R`, `PF_W`, `PF_X`).
    pub flags: u32,
}

impl Segment {
    /// Memory protection for this segment, translated 1:1 from `p_flags`.
    pub fn prot(&self) -> libc::c_int {
        let mut prot: libc::c_int = 0;
        if self.flags & PF_R != 0 {
            prot |= libc::PROT_READ;
        }
        if self.flags & PF_W != 0 {
            prot |= libc::PROT_WRITE;
        }
        if self.flags & PF_X != 0 {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    /// First address of the page containing `vaddr`.
    pub fn page_start(&self) -> u64 {
        page_start(self.vaddr)
    }

    /// End of the last page the segment occupies in memory.
    pub fn page_end(&self) -> u64 {
        page_align(self.vaddr + self.memsz)
    }

    /// Size of the file-backed part of the mapping, in whole pages.
    pub fn file_map_size(&self) -> u64 {
        if self.filesz == 0 {
            return 0;
        }
        page_align(self.filesz + page_offset(self.vaddr))
    }

    /// File offset that corresponds to [`Segment::page_start`].
    pub fn page_file_offset(&self) -> u64 {
        self.offset - page_offset(self.vaddr)
    }

    /// First byte of the zero-initialised region.
    pub fn bss_start(&self) -> u64 {
        self.vaddr + self.filesz
    }

    pub fn has_bss(&self) -> bool {
        self.memsz > self.filesz
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.page_start() <= addr && addr < self.page_end()
    }
}

/// The ordered loadable segments of one executable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    pub fn from_program_headers(phdrs: &[ProgramHeader]) -> Result<Self> {
        let mut segments = Vec::new();
        for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
            if ph.p_memsz < ph.p_filesz {
                return Err(Error::MalformedProgramHeaders(format!(
                    "segment at {:#x} has memsz {:#x} < filesz {:#x}",
                    ph.p_vaddr, ph.p_memsz, ph.p_filesz
                )));
            }
            if page_offset(ph.p_vaddr) != page_offset(ph.p_offset) {
                return Err(Error::MalformedProgramHeaders(format!(
                    "segment at {:#x} is not congruent with its file offset {:#x}",
                    ph.p_vaddr, ph.p_offset
                )));
            }
            // Every address computed from the segment, up to its page-aligned
            // end, must fit in a u64.
            let mem_end = ph
                .p_vaddr
                .checked_add(ph.p_memsz)
                .filter(|end| *end <= u64::MAX - (PAGE_SIZE - 1));
            if mem_end.is_none() || ph.p_offset.checked_add(ph.p_filesz).is_none() {
                return Err(Error::MalformedProgramHeaders(format!(
                    "segment at {:#x} (memsz {:#x}, offset {:#x}, filesz {:#x}) overflows the address space",
                    ph.p_vaddr, ph.p_memsz, ph.p_offset, ph.p_filesz
                )));
            }
            segments.push(Segment {
                vaddr: ph.p_vaddr,
                offset: ph.p_offset,
                filesz: ph.p_filesz,
                memsz: ph.p_memsz,
                flags: ph.p_flags,
            });
        }
        Ok(Self { segments })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Find the segment whose page range contains `addr`.
    pub fn find(&self, addr: u64) -> Option<(usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(addr))
    }

    /// Virtual address of the program-header table, if some segment maps it.
    pub fn phdr_addr(&self, phoff: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| s.offset <= phoff && phoff < s.offset + s.filesz)
            .map(|s| phoff - s.offset + s.vaddr)
    }
}

impl<'a> IntoIterator for &'a SegmentTable {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

/// Read and validate the ELF file header at offset 0.
pub fn read_header(file: &File) -> Result<ElfHeader> {
    let mut buf = [0u8; SIZEOF_EHDR];
    file.read_exact_at(&mut buf, 0)
        .map_err(|e| Error::MalformedHeader(format!("cannot read header: {}", e)))?;
    if buf[..SELFMAG] != ELFMAG[..] {
        return Err(Error::MalformedHeader("bad ELF magic".into()));
    }

    let header =
        Elf::parse_header(&buf).map_err(|e| Error::MalformedHeader(e.to_string()))?;
    if header.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(Error::MalformedHeader("not a 64-bit ELF file".into()));
    }
    let container = header
        .container()
        .map_err(|e| Error::MalformedHeader(e.to_string()))?;
    let endian = header
        .endianness()
        .map_err(|e| Error::MalformedHeader(e.to_string()))?;

    Ok(ElfHeader {
        entry: header.e_entry,
        phoff: header.e_phoff,
        phnum: header.e_phnum,
        phentsize: header.e_phentsize,
        machine: header.e_machine,
        e_type: header.e_type,
        ctx: Ctx::new(container, endian),
    })
}

/// Read the program-header table described by `header`.
pub fn read_program_headers(file: &File, header: &ElfHeader) -> Result<Vec<ProgramHeader>> {
    if header.phentsize as usize != SIZEOF_PHDR {
        return Err(Error::MalformedProgramHeaders(format!(
            "unexpected program header size {}",
            header.phentsize
        )));
    }
    let size = header.phnum as usize * SIZEOF_PHDR;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|e| Error::MalformedProgramHeaders(e.to_string()))?;
    buf.resize(size, 0);
    file.read_exact_at(&mut buf, header.phoff).map_err(|e| {
        Error::MalformedProgramHeaders(format!(
            "cannot read {} entries at {:#x}: {}",
            header.phnum, header.phoff, e
        ))
    })?;

    ProgramHeader::parse(&buf, 0, header.phnum as usize, header.ctx)
        .map_err(|e| Error::MalformedProgramHeaders(e.to_string()))
}

/// Reject executables this loader cannot start.
pub fn check_compatible(header: &ElfHeader, phdrs: &[ProgramHeader]) -> Result<()> {
    if header.machine != HOST_MACHINE {
        return Err(Error::UnsupportedBinary(format!(
            "machine {} does not match host machine {}",
            goblin::elf::header::machine_to_str(header.machine),
            goblin::elf::header::machine_to_str(HOST_MACHINE),
        )));
    }
    if header.e_type != ET_EXEC {
        return Err(Error::UnsupportedBinary(format!(
            "{} is not a static executable",
            goblin::elf::header::et_to_str(header.e_type)
        )));
    }
    if phdrs.iter().any(|ph| ph.p_type == PT_INTERP) {
        return Err(Error::UnsupportedBinary(
            "dynamically linked executables are not supported".into(),
        ));
    }
    Ok(())
}

/// Read the header, the program headers and build the segment table.
pub fn read_elf(file: &File) -> Result<(ElfHeader, Vec<ProgramHeader>, SegmentTable)> {
    let header = read_header(file)?;
    let phdrs = read_program_headers(file, &header)?;
    check_compatible(&header, &phdrs)?;
    let segments = SegmentTable::from_program_headers(&phdrs)?;
    if segments.is_empty() {
        return Err(Error::UnsupportedBinary("no loadable segments".into()));
    }
    debug!(
        "ELF entry=0x{:016x} phoff={:#x} phnum={} loadable={}",
        header.entry,
        header.phoff,
        header.phnum,
        segments.len()
    );
    Ok((header, phdrs, segments))
}
