use crate::arch;
use crate::auxv;
use crate::fault;
use crate::image::BinaryImage;
use crate::mmap;
use crate::pager::{DemandMapper, EagerMapper, LoadInfo, SegmentMapper};
use crate::random;
use crate::stack::{StackImage, StackParams};
use crate::{Error, Result};
use tracing::{debug, trace};

/// Default size of the loaded program's stack.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// How segments are brought into memory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Map every segment before handoff.
    #[default]
    Eager,
    /// Reserve segments and back pages on first access.
    Demand,
}

pub struct LoaderBuilder {
    strategy: Strategy,
    stack_size: usize,
    seed: Option<u64>,
}

impl Default for LoaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderBuilder {
    pub fn new() -> Self {
        Self {
            strategy: Strategy::Eager,
            stack_size: DEFAULT_STACK_SIZE,
            seed: None,
        }
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Seed for the `AT_RANDOM` bytes. Defaults to the loader's own.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Loader {
        Loader {
            strategy: self.strategy,
            stack_size: self.stack_size,
            seed: self.seed,
        }
    }
}

/// Where control goes once the image is ready.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Launch {
    pub sp: u64,
    pub entry: u64,
}

/// Loads one static executable into the current process
pub struct Loader {
    strategy: Strategy,
    stack_size: usize,
    seed: Option<u64>,
}

impl Loader {
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn mapper(&self) -> &'static dyn SegmentMapper {
        match self.strategy {
            Strategy::Eager => &EagerMapper,
            Strategy::Demand => &DemandMapper,
        }
    }

    /// Establish the memory image and the initial stack.
    ///
    /// Consumes the image: in eager mode its file is closed here, in demand
    /// mode the fault handler keeps its own descriptor.
    pub fn prepare(&self, image: BinaryImage) -> Result<Launch> {
        let load = self.mapper().map_segments(&image)?;
        debug!(
            "Mapped {} segments ({:?}), entry=0x{:016x} phdr=0x{:016x}",
            image.segments.len(),
            self.strategy,
            load.entry,
            load.phdr_addr
        );

        let stack = self.build_stack(&image, load)?;
        drop(image);

        self.reset_signals()?;
        Ok(Launch {
            sp: stack.sp(),
            entry: load.entry,
        })
    }

    fn build_stack(&self, image: &BinaryImage, load: LoadInfo) -> Result<StackImage> {
        random::init(self.seed.or_else(auxv::host_random_seed).unwrap_or(random::DEFAULT_SEED));

        let base = mmap::map_stack(self.stack_size)?;
        let top = base + self.stack_size as u64;
        let stack = StackImage::build(
            top,
            &StackParams {
                argv: &image.argv,
                envp: &image.envp,
                auxv: &image.auxv,
                load,
                platform: arch::PLATFORM,
                random: random::at_random_bytes(),
            },
        );
        if stack.len() > self.stack_size {
            let _ = mmap::unmap(base, self.stack_size);
            return Err(Error::StackTooSmall {
                needed: stack.len(),
                available: self.stack_size,
            });
        }
        unsafe {
            stack.write_to_memory();
        }

        trace!(
            "Stack 0x{:016x}-0x{:016x}, sp=0x{:016x}",
            base,
            top,
            stack.sp()
        );
        if let Some(parsed) = stack.parse() {
            trace!(
                "Stack check: argc={} envc={} auxc={}",
                parsed.argc,
                parsed.envp.len(),
                parsed.auxv.len()
            );
        }
        Ok(stack)
    }

    /// Give the program the dispositions a fresh `execve` would.
    fn reset_signals(&self) -> Result<()> {
        // The Rust runtime ignores SIGPIPE and catches SIGSEGV/SIGBUS for
        // stack overflow reports.
        fault::restore_default(libc::SIGPIPE)?;
        fault::restore_default(libc::SIGBUS)?;
        if self.strategy == Strategy::Eager {
            fault::restore_default(libc::SIGSEGV)?;
        }
        Ok(())
    }

    fn execve_impl(&self, image: BinaryImage) -> Result<Launch> {
        let launch = self.prepare(image)?;
        trace!(
            "Entering program: entry=0x{:016x} sp=0x{:016x}",
            launch.entry,
            launch.sp
        );
        Ok(launch)
    }

    /// Load `image` and become it. Never returns.
    pub fn execve(&self, image: BinaryImage) -> ! {
        match self.execve_impl(image) {
            Ok(launch) => unsafe { arch::enter(launch.sp, launch.entry) },
            Err(e) => {
                eprintln!("elfpager: {}: {}", e.stage(), e);
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let loader = LoaderBuilder::new().build();
        assert_eq!(loader.strategy(), Strategy::Eager);
        assert_eq!(loader.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(loader.seed, None);

        let loader = LoaderBuilder::new()
            .strategy(Strategy::Demand)
            .stack_size(64 * 1024)
            .seed(42)
            .build();
        assert_eq!(loader.strategy(), Strategy::Demand);
        assert_eq!(loader.stack_size, 64 * 1024);
        assert_eq!(loader.seed, Some(42));
    }
}
