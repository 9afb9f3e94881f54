use std::ffi::{CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::{env, process::exit};
use tracing_subscriber::EnvFilter;

use elfpager::{BinaryImage, Error, LoaderBuilder, Strategy};

const USAGE: &str =
    "usage: elfpager [--demand|--eager] [--stack-size BYTES] [--seed N] [--] <program> [arguments...]";

#[derive(Debug)]
struct Opts {
    /// How segments are mapped.
    strategy: Strategy,

    /// Size of the program's stack.
    stack_size: Option<usize>,

    /// Seed for the `AT_RANDOM` bytes.
    seed: Option<u64>,

    /// The program to run.
    program: OsString,

    /// The arguments to pass to the program, including the program itself.
    program_args: Vec<OsString>,
}

fn main() {
    setup_logging();

    let args: Vec<OsString> = env::args_os().collect();
    let opts = match parse_opts(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("elfpager: {}", msg);
            eprintln!("{}", USAGE);
            exit(1);
        }
    };

    let image = match open_image(&opts) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("elfpager: {}: {}", e.stage(), e);
            exit(1);
        }
    };

    let mut loader = LoaderBuilder::new().strategy(opts.strategy);
    if let Some(stack_size) = opts.stack_size {
        loader = loader.stack_size(stack_size);
    }
    if let Some(seed) = opts.seed {
        loader = loader.seed(seed);
    }
    loader.build().execve(image);
}

fn open_image(opts: &Opts) -> Result<BinaryImage, Error> {
    let argv = opts
        .program_args
        .iter()
        .map(|arg| to_cstring(arg.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    let envp = env::vars_os()
        .map(|(key, value)| {
            let mut var = key;
            var.push("=");
            var.push(value);
            to_cstring(var)
        })
        .collect::<Result<Vec<_>, _>>()?;
    BinaryImage::open(&opts.program, argv, envp)
}

fn to_cstring(s: OsString) -> Result<CString, Error> {
    CString::new(s.into_vec()).map_err(|e| {
        Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })
}

fn parse_opts(args: &[OsString]) -> Result<Opts, String> {
    let mut strategy = Strategy::Eager;
    let mut stack_size = None;
    let mut seed = None;
    let mut rest: &[OsString] = &[];
    let mut i = 1; // Skip program name
    while i < args.len() {
        let arg = args[i].as_bytes();
        if arg == b"--demand" {
            strategy = Strategy::Demand;
            i += 1;
        } else if arg == b"--eager" {
            strategy = Strategy::Eager;
            i += 1;
        } else if arg == b"--stack-size" {
            stack_size = Some(parse_number(args.get(i + 1), "--stack-size")? as usize);
            i += 2;
        } else if arg == b"--seed" {
            seed = Some(parse_number(args.get(i + 1), "--seed")?);
            i += 2;
        } else if arg == b"--" {
            rest = &args[i + 1..];
            break;
        } else if arg.starts_with(b"--") {
            return Err(format!("unknown option {}", args[i].to_string_lossy()));
        } else {
            rest = &args[i..];
            break;
        }
    }
    let Some(program) = rest.first() else {
        return Err("no program given".to_string());
    };
    Ok(Opts {
        strategy,
        stack_size,
        seed,
        program: program.clone(),
        program_args: rest.to_vec(),
    })
}

/// Decimal, or hex with a `0x` prefix.
fn parse_number(arg: Option<&OsString>, name: &str) -> Result<u64, String> {
    let Some(arg) = arg.and_then(|arg| arg.to_str()) else {
        return Err(format!("{} needs a value", name));
    };
    let parsed = match arg.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    parsed.map_err(|_| format!("invalid value for {}: {}", name, arg))
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn program_after_options() {
        let opts = parse_opts(&args(&["elfpager", "--demand", "--seed", "7", "./prog", "x"])).unwrap();
        assert_eq!(opts.strategy, Strategy::Demand);
        assert_eq!(opts.seed, Some(7));
        assert_eq!(opts.stack_size, None);
        assert_eq!(opts.program, OsString::from("./prog"));
        assert_eq!(opts.program_args, args(&["./prog", "x"]));
    }

    #[test]
    fn double_dash_ends_options() {
        let opts = parse_opts(&args(&[
            "elfpager",
            "--stack-size",
            "0x10000",
            "--",
            "prog",
            "--demand",
        ]))
        .unwrap();
        assert_eq!(opts.strategy, Strategy::Eager);
        assert_eq!(opts.stack_size, Some(0x10000));
        assert_eq!(opts.program_args, args(&["prog", "--demand"]));
    }

    #[test]
    fn rejects_bad_invocations() {
        assert!(parse_opts(&args(&["elfpager"])).is_err());
        assert!(parse_opts(&args(&["elfpager", "--"])).is_err());
        assert!(parse_opts(&args(&["elfpager", "--seed"])).is_err());
        assert!(parse_opts(&args(&["elfpager", "--seed", "abc", "prog"])).is_err());
        assert!(parse_opts(&args(&["elfpager", "--bogus", "prog"])).is_err());
    }
}
