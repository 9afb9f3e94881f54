//! Page fault interception.
//!
//! Faults are delivered as SIGSEGV. The signal handler turns the `siginfo_t`
//! into a [`FaultEvent`] and passes it to the one registered
//! [`PageFaultHandler`]. The registry is process-wide and can be set once:
//! a process runs at most one demand-paged program.
//!
//! Once the loaded program runs, it owns the thread pointer, the heap and
//! errno. Code reachable from [`on_page_fault`] therefore must not allocate,
//! log or use thread-locals; fatal errors are formatted into a stack buffer
//! and written straight to fd 2.

use crate::{Error, Result};
use libc::{c_int, siginfo_t};
use std::fmt::Write;
use std::sync::OnceLock;

const SEGV_MAPERR: c_int = 1;
const SEGV_ACCERR: c_int = 2;

/// Exit status after an unrecoverable fault.
pub const EXIT_FAULT: c_int = 1;

/// Why the hardware refused an access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Nothing is mapped at the address (`SEGV_MAPERR`).
    Unmapped,
    /// A mapping exists but forbids the access (`SEGV_ACCERR`).
    Protection,
    /// Any other `si_code`.
    Other(i32),
}

impl FaultKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            SEGV_MAPERR => FaultKind::Unmapped,
            SEGV_ACCERR => FaultKind::Protection,
            other => FaultKind::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            FaultKind::Unmapped => SEGV_MAPERR,
            FaultKind::Protection => SEGV_ACCERR,
            FaultKind::Other(code) => code,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultEvent {
    pub addr: u64,
    pub kind: FaultKind,
}

/// Something that can back the page a fault hit.
///
/// Returning [`Error::UnexpectedFaultKind`] hands the fault back to the
/// program: the default SIGSEGV action is restored and the access crashes
/// normally. Any other error terminates the process.
pub trait PageFaultHandler: Sync {
    fn handle(&self, event: FaultEvent) -> Result<()>;
}

static HANDLER: OnceLock<&'static dyn PageFaultHandler> = OnceLock::new();

/// Register `handler` and route SIGSEGV to it.
pub fn install(handler: &'static dyn PageFaultHandler) -> Result<()> {
    HANDLER.set(handler).map_err(|_| {
        Error::HandlerInstall("a page fault handler is already registered".into())
    })?;
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_page_fault as *const () as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut()) < 0 {
            return Err(Error::HandlerInstall(
                std::io::Error::last_os_error().to_string(),
            ));
        }
    }
    Ok(())
}

/// Reset `sig` to its default action.
pub fn restore_default(sig: c_int) -> std::io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// # Safety
///
/// Installed as a `SA_SIGINFO` handler; `info` must be the kernel-provided
/// `siginfo_t` for a SIGSEGV.
unsafe extern "C" fn on_page_fault(sig: c_int, info: *mut siginfo_t, _context: *mut libc::c_void) {
    let (addr, code) = unsafe { ((*info).si_addr() as u64, (*info).si_code) };
    let event = FaultEvent {
        addr,
        kind: FaultKind::from_code(code),
    };

    let Some(handler) = HANDLER.get() else {
        let _ = restore_default(sig);
        return;
    };
    match handler.handle(event) {
        Ok(()) => {}
        Err(Error::UnexpectedFaultKind { .. }) => {
            // Returning re-executes the access, which now takes the default
            // action.
            let _ = restore_default(sig);
        }
        Err(err) => {
            report(&err);
            unsafe { libc::_exit(EXIT_FAULT) };
        }
    }
}

/// Fixed-capacity formatting buffer; output past the end is dropped.
struct StackBuf {
    buf: [u8; 160],
    len: usize,
}

impl StackBuf {
    const fn new() -> Self {
        Self {
            buf: [0; 160],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Write for StackBuf {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn format_fatal(out: &mut StackBuf, err: &Error) {
    let _ = match err {
        Error::NoOwningSegment(addr) => writeln!(
            out,
            "elfpager: fault-resolve: no loadable segment owns address {:#x}",
            addr
        ),
        Error::PageBackingFailed { addr, source } => writeln!(
            out,
            "elfpager: fault-resolve: failed to back page at {:#x} (errno {})",
            addr,
            source.raw_os_error().unwrap_or(0)
        ),
        _ => writeln!(out, "elfpager: fault-resolve: unrecoverable page fault"),
    };
}

fn report(err: &Error) {
    let mut out = StackBuf::new();
    format_fatal(&mut out, err);
    let bytes = out.as_bytes();
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}
