//! The executable being loaded and the vectors it will start with.

use crate::auxv::{self, AuxEntry};
use crate::elf::{self, ElfHeader, SegmentTable};
use crate::{Error, Result};
use goblin::elf::program_header::ProgramHeader;
use std::ffi::CString;
use std::fs::File;
use std::path::Path;

/// An opened and parsed executable plus its argv, envp and auxv.
pub struct BinaryImage {
    pub(crate) file: File,
    pub header: ElfHeader,
    pub(crate) program_headers: Vec<ProgramHeader>,
    pub segments: SegmentTable,
    /// The loaded program's argument vector; `argv[0]` names the program.
    pub argv: Vec<CString>,
    /// Environment strings, passed through unchanged.
    pub envp: Vec<CString>,
    /// The loader's own auxiliary vector, without the `AT_NULL` terminator.
    pub auxv: Vec<AuxEntry>,
}

impl BinaryImage {
    /// Open `path` and parse its ELF headers.
    pub fn open(
        path: impl AsRef<Path>,
        argv: Vec<CString>,
        envp: Vec<CString>,
    ) -> Result<BinaryImage> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if !file.metadata()?.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )
            .into());
        }
        Self::from_file(file, argv, envp, auxv::read_host()?)
    }

    /// Parse an already opened executable.
    pub fn from_file(
        file: File,
        argv: Vec<CString>,
        envp: Vec<CString>,
        auxv: Vec<AuxEntry>,
    ) -> Result<BinaryImage> {
        if argv.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "argv must name the program",
            )));
        }
        let (header, program_headers, segments) = elf::read_elf(&file)?;
        Ok(Self {
            file,
            header,
            program_headers,
            segments,
            argv,
            envp,
            auxv,
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}
