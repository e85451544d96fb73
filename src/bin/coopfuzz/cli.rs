//! The command line interface of the fuzzer

use std::path::PathBuf;

use clap::Parser;

use coopfuzz::config;

#[derive(Debug, Parser)]
#[command(
    about = "Cooperative coverage-guided fuzzing orchestrator: replays sibling fuzzers' \
             finds against an instrumented target and keeps what matters"
)]
pub struct Cli {
    #[arg(
        help = "The directory to store all outputs in",
        short = 'o',
        long = "out-dir",
        required = true
    )]
    pub out_dir: PathBuf,

    #[arg(
        help = "Distributed mode: our id in the sync root, running deterministic stages",
        short = 'M',
        long = "main-id",
        conflicts_with = "secondary_id"
    )]
    pub main_id: Option<String>,

    #[arg(
        help = "Distributed mode: our id in the sync root, skipping deterministic stages",
        short = 'S',
        long = "secondary-id"
    )]
    pub secondary_id: Option<String>,

    #[arg(
        help = "Shared directory where sibling fuzzers publish their finds",
        short = 's',
        long = "sync-dir"
    )]
    pub sync_dir: Option<PathBuf>,

    #[arg(
        help = "File the target reads the test case from, instead of <out>/.cur_input",
        short = 'f',
        long = "input-file"
    )]
    pub input_file: Option<PathBuf>,

    #[arg(
        help = "Timeout for each individual execution, in milliseconds; append '+' to \
                insist on the exact value",
        short = 't',
        long = "timeout"
    )]
    pub timeout: Option<String>,

    #[arg(
        help = "Memory limit for the child process: <N>{T|G|M|k} or 'none'",
        short = 'm',
        long = "mem-limit"
    )]
    pub mem_limit: Option<String>,

    #[arg(
        help = "Run the target under the binary-only emulator",
        short = 'Q',
        long = "qemu"
    )]
    pub qemu_mode: bool,

    #[arg(
        help = "Keep the emulator's stderr in <out>/qemu_log",
        short = 'L',
        long = "qemu-log"
    )]
    pub qemu_log: bool,

    #[arg(
        help = "Dumb mode: fork and exec per input, no instrumentation expected",
        short = 'n',
        long = "dumb"
    )]
    pub dumb_mode: bool,

    #[arg(
        help = "Skip deterministic stages",
        short = 'd',
        long = "skip-deterministic"
    )]
    pub skip_deterministic: bool,

    #[arg(
        help = "Crash exploration: crashing executions are the sought outcome",
        short = 'C',
        long = "crash-mode"
    )]
    pub crash_mode: bool,

    #[arg(help = "Banner recorded in fuzzer_stats", short = 'T', long = "banner")]
    pub banner: Option<String>,

    #[arg(
        help = "Seed the virgin map from a previous session's fuzz_bitmap",
        short = 'B',
        long = "load-bitmap"
    )]
    pub in_bitmap: Option<PathBuf>,

    #[arg(
        help = "Trim imported cases before persisting them",
        short = 'r',
        long = "trim-cases"
    )]
    pub trim_cases: bool,

    #[arg(
        help = "Only consume sibling directories whose name starts with this prefix",
        long = "peer-prefix",
        default_value = ""
    )]
    pub peer_prefix: String,

    #[arg(
        help = "Peers whose consumed entries we unlink on their behalf; may repeat",
        long = "novel-peer"
    )]
    pub novel_peers: Vec<String>,

    #[arg(
        help = "Also replay each peer's crashes/ subdirectory",
        long = "sync-crashes"
    )]
    pub sync_crashes: bool,

    #[arg(
        help = "The instrumented binary we want to fuzz",
        name = "EXEC",
        required = true
    )]
    pub executable: String,

    #[arg(
        help = "Arguments passed to the target; @@ is replaced with the input file path",
        name = "arguments",
        num_args(0..),
        allow_hyphen_values = true,
        trailing_var_arg = true
    )]
    pub arguments: Vec<String>,
}

/// Parsed `-t` value.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutArg {
    pub millis: u64,
    pub hard: bool,
}

/// Parse `-t <ms>[+]`.
pub fn parse_timeout(raw: &str) -> Result<TimeoutArg, String> {
    let (digits, hard) = match raw.strip_suffix('+') {
        Some(digits) => (digits, true),
        None => (raw, false),
    };
    let millis: u64 = digits
        .parse()
        .map_err(|_| format!("Bad syntax used for -t: '{raw}'"))?;
    if millis < 5 {
        return Err("Dangerously low value of -t".to_string());
    }
    Ok(TimeoutArg { millis, hard })
}

/// Parse `-m <N>{T|G|M|k}` or `-m none`, into MB.
pub fn parse_mem_limit(raw: &str) -> Result<u64, String> {
    if raw == "none" {
        return Ok(0);
    }

    let (digits, suffix) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&raw[..idx], Some(c)),
        _ => (raw, None),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("Bad syntax used for -m: '{raw}'"))?;

    let mb = match suffix {
        Some('T') => value * 1024 * 1024,
        Some('G') => value * 1024,
        Some('M') | None => value,
        Some('k') => value / 1024,
        Some(other) => return Err(format!("Unsupported -m suffix: '{other}'")),
    };

    if mb < 5 {
        return Err("Dangerously low value of -m".to_string());
    }
    if std::mem::size_of::<nix::libc::rlim_t>() == 4 && mb > 2000 {
        return Err("Value of -m out of range on 32-bit systems".to_string());
    }
    Ok(mb)
}

/// Validate a `-M`/`-S` id the way the sync layer expects it.
pub fn validate_sync_id(id: &str) -> Result<(), String> {
    if id.len() > 64 {
        return Err("Fuzzer ID too long".to_string());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Non-alphanumeric fuzzer ID specified via -S or -M".to_string());
    }
    Ok(())
}

/// Default `-m` when the user did not pick one.
pub fn default_mem_limit(qemu_mode: bool) -> u64 {
    if qemu_mode {
        config::MEM_LIMIT_QEMU_MB
    } else {
        config::MEM_LIMIT_MB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_suffix() {
        let t = parse_timeout("1000").unwrap();
        assert_eq!((t.millis, t.hard), (1000, false));
        let t = parse_timeout("250+").unwrap();
        assert_eq!((t.millis, t.hard), (250, true));
        assert!(parse_timeout("2").is_err());
        assert!(parse_timeout("abc").is_err());
    }

    #[test]
    fn mem_limit_suffixes() {
        assert_eq!(parse_mem_limit("none").unwrap(), 0);
        assert_eq!(parse_mem_limit("50").unwrap(), 50);
        assert_eq!(parse_mem_limit("50M").unwrap(), 50);
        assert_eq!(parse_mem_limit("2G").unwrap(), 2048);
        assert_eq!(parse_mem_limit("1T").unwrap(), 1024 * 1024);
        assert!(parse_mem_limit("1k").is_err());
        assert!(parse_mem_limit("4").is_err());
        assert!(parse_mem_limit("50X").is_err());
    }

    #[test]
    fn sync_ids() {
        assert!(validate_sync_id("peer-01_a").is_ok());
        assert!(validate_sync_id("bad/peer").is_err());
        assert!(validate_sync_id(&"x".repeat(65)).is_err());
    }
}
