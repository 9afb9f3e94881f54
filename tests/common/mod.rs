//! Builds minimal static ELF64 executables for tests.
#![allow(dead_code)]

use goblin::elf::header::ET_EXEC;
use goblin::elf::program_header::{PF_R, PF_X, PT_INTERP, PT_LOAD};
use std::ffi::CString;
use std::io::Write;
use tempfile::NamedTempFile;

pub const PAGE: u64 = 4096;
pub const TEXT_VADDR: u64 = 0x400000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINE: u16 = goblin::elf::header::EM_X86_64;
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: u16 = goblin::elf::header::EM_AARCH64;

#[cfg(target_arch = "x86_64")]
pub const FOREIGN_MACHINE: u16 = goblin::elf::header::EM_AARCH64;
#[cfg(target_arch = "aarch64")]
pub const FOREIGN_MACHINE: u16 = goblin::elf::header::EM_X86_64;

struct SegmentSpec {
    vaddr: u64,
    flags: u32,
    bytes: Vec<u8>,
    filesz: u64,
    memsz: u64,
}

/// A text segment holding the headers and `code`, plus optional data
/// segments. The entry point is the first byte of `code`.
pub struct ElfBuilder {
    text_vaddr: u64,
    machine: u16,
    e_type: u16,
    interp: bool,
    code: Vec<u8>,
    segments: Vec<SegmentSpec>,
}

impl ElfBuilder {
    pub fn new(code: &[u8]) -> Self {
        Self {
            text_vaddr: TEXT_VADDR,
            machine: HOST_MACHINE,
            e_type: ET_EXEC,
            interp: false,
            code: code.to_vec(),
            segments: Vec::new(),
        }
    }

    pub fn text_at(mut self, vaddr: u64) -> Self {
        self.text_vaddr = vaddr;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    pub fn interp(mut self) -> Self {
        self.interp = true;
        self
    }

    pub fn segment(self, vaddr: u64, flags: u32, bytes: &[u8], memsz: u64) -> Self {
        let filesz = bytes.len() as u64;
        self.segment_with_filesz(vaddr, flags, bytes, filesz, memsz)
    }

    /// Like [`ElfBuilder::segment`], but only the first `filesz` bytes belong
    /// to the segment; the rest is written to the file after it.
    pub fn segment_with_filesz(
        mut self,
        vaddr: u64,
        flags: u32,
        bytes: &[u8],
        filesz: u64,
        memsz: u64,
    ) -> Self {
        self.segments.push(SegmentSpec {
            vaddr,
            flags,
            bytes: bytes.to_vec(),
            filesz,
            memsz,
        });
        self
    }

    fn phnum(&self) -> usize {
        1 + self.segments.len() + self.interp as usize
    }

    fn headers_len(&self) -> usize {
        EHDR_SIZE + PHDR_SIZE * self.phnum()
    }

    pub fn entry(&self) -> u64 {
        self.text_vaddr + self.headers_len() as u64
    }

    pub fn build(&self) -> Vec<u8> {
        let text_len = (self.headers_len() + self.code.len()) as u64;

        // Data segments go after the text, congruent with their addresses.
        let mut offsets = Vec::new();
        let mut cur = text_len;
        for segment in &self.segments {
            let offset = cur.next_multiple_of(PAGE) + segment.vaddr % PAGE;
            offsets.push(offset);
            cur = offset + segment.bytes.len() as u64;
        }

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&self.machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry().to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.phnum() as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(out.len(), EHDR_SIZE);

        push_phdr(
            &mut out,
            PT_LOAD,
            PF_R | PF_X,
            0,
            self.text_vaddr,
            text_len,
            text_len,
        );
        for (segment, offset) in self.segments.iter().zip(&offsets) {
            push_phdr(
                &mut out,
                PT_LOAD,
                segment.flags,
                *offset,
                segment.vaddr,
                segment.filesz,
                segment.memsz,
            );
        }
        if self.interp {
            push_phdr(&mut out, PT_INTERP, PF_R, 0, 0, 0, 0);
        }
        assert_eq!(out.len(), self.headers_len());

        out.extend_from_slice(&self.code);
        for (segment, offset) in self.segments.iter().zip(&offsets) {
            out.resize(*offset as usize, 0);
            out.extend_from_slice(&segment.bytes);
        }
        out
    }

    /// Write the executable to a temporary file under the target directory.
    pub fn write(&self) -> NamedTempFile {
        write_bytes(&self.build())
    }
}

fn push_phdr(
    out: &mut Vec<u8>,
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&PAGE.to_le_bytes());
}

pub fn write_bytes(bytes: &[u8]) -> NamedTempFile {
    // The system temp dir may be mounted noexec, which breaks PROT_EXEC maps.
    let mut file = tempfile::Builder::new()
        .prefix("elfpager-")
        .tempfile_in(env!("CARGO_TARGET_TMPDIR"))
        .unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

pub fn cstrings(list: &[&str]) -> Vec<CString> {
    list.iter().map(|s| CString::new(*s).unwrap()).collect()
}

/// Copy `len` bytes of mapped memory at `addr`.
pub fn read_memory(addr: u64, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(addr as *const u8, len).to_vec() }
}

/// Permissions of the mapping holding `addr`, as `/proc/self/maps` shows them.
pub fn page_perms(addr: u64) -> String {
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next().unwrap().split_once('-').unwrap();
        let perms = fields.next().unwrap();
        let start = u64::from_str_radix(start, 16).unwrap();
        let end = u64::from_str_radix(end, 16).unwrap();
        if start <= addr && addr < end {
            return perms.to_string();
        }
    }
    panic!("{:#x} is not mapped", addr);
}
