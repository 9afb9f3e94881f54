//! Initial process stack construction.
//!
//! The C runtime's `_start` expects the stack pointer to address this layout:
//!
//! ```text
//! stack_top  ->  [env strings][arg strings]        (high addresses)
//!                padding to 16
//!                platform string, 16 random bytes
//!                padding to 16
//!                AT_NULL, 0
//!                auxv pairs
//!                NULL, envp[envc-1] .. envp[0]
//!                NULL, argv[argc-1] .. argv[0]
//! sp         ->  argc                              (low addresses)
//! ```
//!
//! The image is assembled in an owned buffer that mirrors `[sp, stack_top)`.
//! Every string and table slot gets its final address first; values are then
//! written at `address - sp` as native-endian bytes.

use crate::auxv::{
    AT_BASE, AT_ENTRY, AT_EXECFN, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM, AT_PLATFORM,
    AT_RANDOM, AUXV_ENTRY_SIZE, AuxEntry,
};
use crate::page::{PAGE_SIZE, align_down};
use crate::pager::LoadInfo;
use std::ffi::{CStr, CString};

const WORD: u64 = 8;
const STACK_ALIGN: u64 = 16;

/// Entries the C runtime relies on; appended when the host vector lacks them.
const REQUIRED_AUXV: [u64; 6] = [AT_PHDR, AT_PHENT, AT_PHNUM, AT_PAGESZ, AT_ENTRY, AT_RANDOM];

/// Everything the stack image is built from.
pub struct StackParams<'a> {
    pub argv: &'a [CString],
    pub envp: &'a [CString],
    /// Host auxiliary vector, without `AT_NULL`.
    pub auxv: &'a [AuxEntry],
    pub load: LoadInfo,
    pub platform: &'a str,
    pub random: [u8; 16],
}

/// The bytes of an initial stack and where they go.
#[derive(Debug, Clone)]
pub struct StackImage {
    sp: u64,
    bytes: Vec<u8>,
    execfn: u64,
    platform: u64,
    random: u64,
}

/// A stack image read back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStack {
    pub argc: u64,
    pub argv: Vec<u64>,
    pub envp: Vec<u64>,
    pub auxv: Vec<AuxEntry>,
}

/// `argv[0]` as the program should see it: a bare name becomes `./name`.
pub fn program_path(name: &CStr) -> CString {
    let bytes = name.to_bytes();
    if bytes.contains(&b'/') {
        return name.to_owned();
    }
    let mut path = Vec::with_capacity(bytes.len() + 2);
    path.extend_from_slice(b"./");
    path.extend_from_slice(bytes);
    // `name` held no interior NUL, so neither does the prefixed copy.
    CString::new(path).unwrap_or_else(|_| name.to_owned())
}

/// Assign addresses to `strings` below `*cur`, last string highest.
fn place_strings(cur: &mut u64, strings: &[&CStr]) -> Vec<u64> {
    let mut addrs = vec![0; strings.len()];
    for (i, s) in strings.iter().enumerate().rev() {
        *cur -= s.to_bytes_with_nul().len() as u64;
        addrs[i] = *cur;
    }
    addrs
}

impl StackImage {
    /// Lay out the initial stack for a stack whose highest address is `top`.
    pub fn build(top: u64, params: &StackParams<'_>) -> StackImage {
        let argv0 = params.argv.first().map(|a| program_path(a));
        let args: Vec<&CStr> = argv0
            .as_deref()
            .into_iter()
            .chain(params.argv.iter().skip(1).map(CString::as_c_str))
            .collect();
        let envs: Vec<&CStr> = params.envp.iter().map(CString::as_c_str).collect();

        let mut cur = top;
        let env_addrs = place_strings(&mut cur, &envs);
        let arg_addrs = place_strings(&mut cur, &args);

        cur = align_down(cur, STACK_ALIGN);
        cur -= params.platform.len() as u64 + 1;
        let platform = cur;
        cur -= params.random.len() as u64;
        let random = cur;
        cur = align_down(cur, STACK_ALIGN);

        let mut image = StackImage {
            sp: 0,
            bytes: Vec::new(),
            execfn: arg_addrs.first().copied().unwrap_or(0),
            platform,
            random,
        };
        let auxv = image.program_auxv(params);

        let words = 1 + (args.len() as u64 + 1) + (envs.len() as u64 + 1);
        let table = words * WORD + (auxv.len() as u64 + 1) * AUXV_ENTRY_SIZE as u64;
        image.sp = align_down(cur - table, STACK_ALIGN);
        image.bytes = vec![0; (top - image.sp) as usize];

        for (addr, s) in arg_addrs.iter().zip(&args).chain(env_addrs.iter().zip(&envs)) {
            image.put(*addr, s.to_bytes_with_nul());
        }
        let mut platform_bytes = params.platform.as_bytes().to_vec();
        platform_bytes.push(0);
        image.put(platform, &platform_bytes);
        image.put(random, &params.random);

        let mut slot = image.sp;
        let mut push = |image: &mut StackImage, value: u64| {
            image.put(slot, &value.to_ne_bytes());
            slot += WORD;
        };
        push(&mut image, args.len() as u64);
        for addr in &arg_addrs {
            push(&mut image, *addr);
        }
        push(&mut image, 0);
        for addr in &env_addrs {
            push(&mut image, *addr);
        }
        push(&mut image, 0);
        for entry in &auxv {
            push(&mut image, entry.a_type);
            push(&mut image, entry.a_val);
        }
        push(&mut image, AT_NULL);
        push(&mut image, 0);

        image
    }

    /// The value a program-specific entry must carry, `None` for entries
    /// that pass through unchanged.
    fn program_value(&self, load: &LoadInfo, a_type: u64) -> Option<u64> {
        match a_type {
            AT_PHDR => Some(load.phdr_addr),
            AT_PHENT => Some(load.phentsize),
            AT_PHNUM => Some(load.phnum),
            AT_ENTRY => Some(load.entry),
            AT_BASE => Some(0),
            AT_RANDOM => Some(self.random),
            AT_PLATFORM => Some(self.platform),
            AT_EXECFN => Some(self.execfn),
            _ => None,
        }
    }

    fn program_auxv(&self, params: &StackParams<'_>) -> Vec<AuxEntry> {
        let mut auxv: Vec<AuxEntry> = params
            .auxv
            .iter()
            .filter(|entry| entry.a_type != AT_NULL)
            .map(|entry| {
                let a_val = self
                    .program_value(&params.load, entry.a_type)
                    .unwrap_or(entry.a_val);
                AuxEntry::new(entry.a_type, a_val)
            })
            .collect();
        for a_type in REQUIRED_AUXV {
            if auxv.iter().any(|entry| entry.a_type == a_type) {
                continue;
            }
            let a_val = self
                .program_value(&params.load, a_type)
                .unwrap_or(PAGE_SIZE);
            auxv.push(AuxEntry::new(a_type, a_val));
        }
        auxv
    }

    fn put(&mut self, addr: u64, data: &[u8]) {
        let off = (addr - self.sp) as usize;
        self.bytes[off..off + data.len()].copy_from_slice(data);
    }

    /// The initial stack pointer: the address holding argc.
    pub fn sp(&self) -> u64 {
        self.sp
    }

    /// Size of the image in bytes, `stack_top - sp`.
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Read the word at stack address `addr`.
    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let off = addr.checked_sub(self.sp)? as usize;
        let bytes = self.bytes.get(off..off + WORD as usize)?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Read the NUL-terminated string at stack address `addr`.
    pub fn read_cstr(&self, addr: u64) -> Option<&CStr> {
        let off = addr.checked_sub(self.sp)? as usize;
        CStr::from_bytes_until_nul(self.bytes.get(off..)?).ok()
    }

    /// Read `len` raw bytes at stack address `addr`.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let off = addr.checked_sub(self.sp)? as usize;
        self.bytes.get(off..off + len)
    }

    /// Walk the table at `sp` back into argc, argv, envp and auxv.
    pub fn parse(&self) -> Option<ParsedStack> {
        let mut addr = self.sp;
        let mut next = || {
            let value = self.read_u64(addr);
            addr += WORD;
            value
        };
        let argc = next()?;
        let mut argv = Vec::new();
        for _ in 0..argc {
            argv.push(next()?);
        }
        if next()? != 0 {
            return None;
        }
        let mut envp = Vec::new();
        loop {
            match next()? {
                0 => break,
                ptr => envp.push(ptr),
            }
        }
        let mut auxv = Vec::new();
        loop {
            let a_type = next()?;
            let a_val = next()?;
            if a_type == AT_NULL {
                break;
            }
            auxv.push(AuxEntry::new(a_type, a_val));
        }
        Some(ParsedStack {
            argc,
            argv,
            envp,
            auxv,
        })
    }

    /// Copy the image into place below `top`.
    ///
    /// # Safety
    ///
    /// `[sp, top)` must be mapped writable and owned by the caller.
    pub unsafe fn write_to_memory(&self) {
        unsafe {
            std::ptr::copy_nonoverlapping(self.bytes.as_ptr(), self.sp as *mut u8, self.bytes.len());
        }
    }
}
