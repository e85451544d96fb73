//! Compile-time tunables and the resolved runtime configuration.
//!
//! The constants mirror the knobs an AFL-instrumented target and its
//! cooperating fuzzers already agree on (map geometry, reserved descriptors,
//! environment variable names), so they are not runtime-configurable.

use std::{os::unix::io::RawFd, path::PathBuf, time::Duration};

/// Coverage map size, as a power of two.
pub const MAP_SIZE_POW2: usize = 16;

/// Number of edge slots in the coverage map shared with the target.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// Environment variable through which the shared-memory id is published.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Descriptor reserved in the child for the control pipe; status is `+ 1`.
pub const FORKSRV_FD: RawFd = 198;

/// Descriptor reserved in the child for the auxiliary code-block-info channel.
pub const CODE_BLOCK_INFO_FD: RawFd = 196;

/// Sentinel the child stub writes at map offset 0 when `exec()` falls through.
pub const EXEC_FAIL_SIG: u32 = 0xfee1_dead;

/// Grace multiplier applied to the exec timeout while waiting for the
/// fork-server hello.
pub const FORK_WAIT_MULT: u32 = 10;

/// Default per-execution timeout.
pub const EXEC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default child memory cap, in MB. Zero disables the cap.
pub const MEM_LIMIT_MB: u64 = 50;

/// Default memory cap under the emulator, in MB.
pub const MEM_LIMIT_QEMU_MB: u64 = 200;

/// Exit code MSAN is told to use, since it cannot `abort_on_error`.
pub const MSAN_ERROR_CODE: i32 = 86;

/// Calibration cycles for a well-behaved new entry.
pub const CAL_CYCLES: u32 = 8;

/// Calibration cycles when the variable-behavior check is disabled.
pub const CAL_CYCLES_NO_VAR: u32 = 4;

/// Calibration cycles once variable behavior is suspected.
pub const CAL_CYCLES_LONG: u32 = 40;

/// Flat addition to the exec timeout while calibrating imported entries (ms).
pub const CAL_TMOUT_ADD_MS: u64 = 50;

/// Percentage stretch of the exec timeout while calibrating imported entries.
pub const CAL_TMOUT_PERC: u64 = 125;

/// Largest input accepted from a sibling fuzzer, in bytes.
pub const MAX_FILE: usize = 1024 * 1024;

/// Cap on the accumulated per-edge hit counter.
pub const ACCU_HITS_CAP: u32 = 1024;

/// Seed for the 32-bit trace hash.
pub const HASH_CONST: u32 = 0xa5b3_5705;

/// File name prefix shared by all queue and crash entries.
pub const CASE_PREFIX: &str = "id:";

/// Sibling queue entries consumed per peer per sync pass.
pub const SYNC_MAX_SEEDS_PER: usize = 20;

/// Granularity of the first trim pass, as a divisor of the input length.
pub const TRIM_START_STEPS: u32 = 16;

/// Inputs larger than this are not worth trimming.
pub const TRIM_MAX_LEN: usize = 10 * 1024;

/// Minutes of recorded progress after which an existing output directory is
/// considered at-risk data and refused.
pub const OUTPUT_GRACE_MINS: u64 = 25;

/// How the target is driven when the fork server is not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumbMode {
    /// Normal instrumented operation.
    Off,
    /// `-n`: no instrumentation assumed, fork/exec per input.
    Plain,
    /// `-n` with `AFL_DUMB_FORKSRV`: uninstrumented target that still
    /// speaks the fork-server protocol.
    WithForkserver,
}

/// Everything the campaign needs to know, resolved from the CLI and the
/// environment before any directory or process is touched.
#[derive(Debug, Clone)]
pub struct Config {
    /// Output directory (`-o`).
    pub out_dir: PathBuf,
    /// Shared sync root (`-s`).
    pub sync_dir: Option<PathBuf>,
    /// Our own id inside the sync root (`-M`/`-S`).
    pub sync_id: Option<String>,
    /// `-M`: run deterministic stages even when siblings cover them.
    pub force_deterministic: bool,
    /// `-d`: skip deterministic stages.
    pub skip_deterministic: bool,
    /// `-f`: fixed input file the target reads, instead of `.cur_input`.
    pub out_file: Option<PathBuf>,
    /// Per-execution timeout (`-t`).
    pub exec_tmout: Duration,
    /// `-t` carried a `+` suffix: the user insists on this exact timeout.
    pub timeout_is_hard: bool,
    /// Child memory cap in MB (`-m`), zero meaning none.
    pub mem_limit_mb: u64,
    /// `-Q`: run the target under the binary-only emulator.
    pub qemu_mode: bool,
    /// `-L`: keep the emulator's stderr in `<out>/qemu_log`.
    pub qemu_log: bool,
    /// `-n` / `AFL_DUMB_FORKSRV`.
    pub dumb_mode: DumbMode,
    /// `AFL_NO_FORKSRV`: fork/exec per input even when instrumented.
    pub no_forkserver: bool,
    /// `AFL_NO_VAR_CHECK`: shorten calibration, never flag variable behavior.
    pub no_var_check: bool,
    /// `AFL_SKIP_BIN_CHECK`: trust the target binary as-is.
    pub skip_bin_check: bool,
    /// `-C`: crash exploration; crashing executions are the sought outcome.
    pub crash_mode: bool,
    /// `-T`: banner recorded in `fuzzer_stats`.
    pub banner: String,
    /// `-B`: seed the virgin map from a previous session's `fuzz_bitmap`.
    pub in_bitmap: Option<PathBuf>,
    /// `-r`: trim imported cases before persisting them.
    pub trim_cases: bool,
    /// Only sibling directories starting with this prefix are consumed.
    pub peer_prefix: String,
    /// Peers whose already-consumed entries we are expected to unlink.
    pub novel_peers: Vec<String>,
    /// Also walk each peer's `crashes/` subdirectory.
    pub sync_crashes: bool,
    /// Resolved absolute path of the target binary.
    pub target_path: PathBuf,
    /// Target argv after the program name, `@@` not yet substituted.
    pub target_args: Vec<String>,
    /// The full original command line, for `fuzzer_stats`.
    pub orig_cmdline: String,
}

impl Config {
    /// The timeout the fork-server hello is awaited under.
    pub fn fork_wait_timeout(&self) -> Duration {
        self.exec_tmout * FORK_WAIT_MULT
    }

    /// Whether the fork server drives executions.
    pub fn uses_forkserver(&self) -> bool {
        self.dumb_mode != DumbMode::Plain && !self.no_forkserver
    }

    /// Calibration timeout for entries that did not originate in our queue.
    /// A `-t` value with a `+` suffix is taken at face value instead.
    pub fn calibration_tmout(&self) -> Duration {
        if self.timeout_is_hard {
            return self.exec_tmout;
        }
        let base = self.exec_tmout.as_millis() as u64;
        Duration::from_millis((base + CAL_TMOUT_ADD_MS).max(base * CAL_TMOUT_PERC / 100))
    }
}
