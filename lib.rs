//! Elfpager - A user-space ELF program loader.
//!
//! Elfpager does the work of a kernel's `exec` path from inside an ordinary
//! process: it parses a static ELF64 executable, establishes its memory image,
//! builds the initial stack the C runtime expects (argc, argv, envp and the
//! auxiliary vector) and jumps to the entry point. The calling process
//! *becomes* the loaded program; loading never returns.
//!
//! # Strategies
//!
//! - **Eager** ([`pager::EagerMapper`]) maps every loadable segment in full
//!   before handoff.
//! - **Demand-paged** ([`pager::DemandMapper`]) only reserves address space
//!   and backs one 4 KiB page at a time from the SIGSEGV handler.
//!
//! # Modules
//!
//! - [`elf`] - ELF header and program-header reading, the segment table
//! - [`page`] - Page alignment arithmetic
//! - [`mmap`] - Thin wrappers over `mmap(2)` and friends
//! - [`image`] - The binary being loaded plus its argv/envp/auxv
//! - [`pager`] - Segment mapping strategies and the page fault resolver
//! - [`fault`] - Page fault interception
//! - [`stack`] - Initial stack image construction
//! - [`arch`] - Architecture-specific process handoff
//! - [`loader`] - Orchestration of a whole load
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. No error is recoverable
//! mid-load: the loader either hands control to the program or reports the
//! failing stage and exits.

pub mod auxv;
pub mod elf;
pub mod fault;
pub mod image;
pub mod loader;
pub mod mmap;
pub mod page;
pub mod pager;
pub mod random;
pub mod stack;

#[cfg(target_arch = "aarch64")]
pub mod arm64;

#[cfg(target_arch = "aarch64")]
pub use arm64 as arch;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(target_arch = "x86_64")]
pub use x86 as arch;

/// Consolidated error type for all loader operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed ELF header: {0}")]
    MalformedHeader(String),

    #[error("malformed program headers: {0}")]
    MalformedProgramHeaders(String),

    #[error("unsupported binary: {0}")]
    UnsupportedBinary(String),

    #[error("failed to map segment at {addr:#x}: {source}")]
    SegmentMapFailed {
        addr: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("no loadable segment owns address {0:#x}")]
    NoOwningSegment(u64),

    #[error("failed to back page at {addr:#x}: {source}")]
    PageBackingFailed {
        addr: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected fault at {addr:#x} (si_code {code})")]
    UnexpectedFaultKind { addr: u64, code: i32 },

    #[error("stack image needs {needed} bytes but the stack has {available}")]
    StackTooSmall { needed: usize, available: usize },

    #[error("cannot install fault handler: {0}")]
    HandlerInstall(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The loader stage an error belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Map,
    FaultResolve,
    StackBuild,
    Setup,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::Map => "map",
            Stage::FaultResolve => "fault-resolve",
            Stage::StackBuild => "stack-build",
            Stage::Setup => "setup",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::MalformedHeader(_)
            | Error::MalformedProgramHeaders(_)
            | Error::UnsupportedBinary(_) => Stage::Parse,
            Error::SegmentMapFailed { .. } => Stage::Map,
            Error::NoOwningSegment(_)
            | Error::PageBackingFailed { .. }
            | Error::UnexpectedFaultKind { .. } => Stage::FaultResolve,
            Error::StackTooSmall { .. } => Stage::StackBuild,
            Error::HandlerInstall(_) | Error::Io(_) => Stage::Setup,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

pub use elf::{ElfHeader, Segment, SegmentTable};
pub use image::BinaryImage;
pub use loader::{Loader, LoaderBuilder, Strategy};
pub use stack::StackImage;
