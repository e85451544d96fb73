//! Driving the instrumented target and classifying what came back.
//!
//! Two drivers exist behind one trait: the persistent fork-server client in
//! [`forkserver`], and the fork/exec-per-input fallback in [`dumb`]. Both
//! share the same child-setup prelude (resource limits, session isolation,
//! descriptor plumbing, sanitizer defaults) so the two paths cannot drift
//! apart.

use core::sync::atomic::{fence, Ordering};
use std::{
    fs::File,
    io,
    os::unix::{io::RawFd, process::CommandExt},
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};

use libafl_bolts::{
    fs::InputFile,
    os::dup2,
    shmem::{ShMem, ShMemProvider, UnixShMem, UnixShMemProvider},
    Error,
};
use nix::libc;

use crate::config::{CODE_BLOCK_INFO_FD, EXEC_FAIL_SIG, FORKSRV_FD, MSAN_ERROR_CODE, SHM_ENV_VAR};

pub mod dumb;
pub mod forkserver;

/// What a single execution of the target amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Clean exit within the time budget.
    Ok,
    /// The time budget expired and the child was killed.
    Hang,
    /// Terminated by a signal, or the sanitizer's designated exit code.
    Crash {
        /// The terminating signal; 0 when the sanitizer exit code fired.
        signal: i32,
    },
    /// The `exec()` in the child fell through; the stub left
    /// [`EXEC_FAIL_SIG`] in the coverage map.
    ExecError,
    /// First calibration execution produced an all-zero map.
    NoInstrumentation,
    /// Calibration of a first-seen entry produced no novelty at all.
    NoBits,
}

impl ExecOutcome {
    pub fn is_crash(&self) -> bool {
        matches!(self, ExecOutcome::Crash { .. })
    }
}

/// The seam between the campaign logic and whatever drives the target.
pub trait TargetExecutor {
    /// Place the next input where the target will read it from.
    fn write_input(&mut self, input: &[u8]) -> Result<(), Error>;

    /// Run the target once against the last written input.
    fn run(&mut self, timeout: Duration) -> Result<ExecOutcome, Error>;

    /// The coverage map filled by the last execution.
    fn trace_bits(&self) -> &[u8];

    /// Total executions performed through this driver.
    fn executions(&self) -> u64;
}

/// Allocate the coverage region and publish its id for the target to attach,
/// unless `publish` is off (plain dumb mode must not let an accidentally
/// instrumented target detect us).
pub fn setup_coverage_shmem(publish: bool) -> Result<UnixShMem, Error> {
    let mut provider = UnixShMemProvider::new()?;
    let shmem = provider.new_shmem(crate::config::MAP_SIZE)?;
    if publish {
        shmem.write_to_env(SHM_ENV_VAR)?;
    }
    Ok(shmem)
}

/// The file the target reads each test case from.
///
/// With `@@` in the argv or `-f`, the target opens the file itself and stdin
/// is left pointing at /dev/null; otherwise the descriptor of `.cur_input`
/// is cloned onto the child's stdin.
#[derive(Debug)]
pub struct TestcaseFile {
    file: InputFile,
    feeds_stdin: bool,
}

impl TestcaseFile {
    pub fn create(path: &Path, feeds_stdin: bool) -> Result<Self, Error> {
        Ok(Self {
            file: InputFile::create(path)?,
            feeds_stdin,
        })
    }

    /// Rewind, write, truncate.
    pub fn write(&mut self, input: &[u8]) -> Result<(), Error> {
        self.file.write_buf(input)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.file.as_raw_fd()
    }

    pub fn feeds_stdin(&self) -> bool {
        self.feeds_stdin
    }
}

/// Where the child's stdout/stderr go.
#[derive(Debug)]
pub enum ChildSinks {
    /// Both to /dev/null.
    Quiet,
    /// stderr kept in a log file (`-L`).
    StderrTo(File),
}

impl ChildSinks {
    fn apply(self, command: &mut Command) {
        match self {
            ChildSinks::Quiet => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
            ChildSinks::StderrTo(log) => {
                command.stdout(Stdio::null()).stderr(Stdio::from(log));
            }
        }
    }
}

/// Child-process configuration applied between `fork()` and `exec()`.
///
/// The `pre_exec` bodies only call async-signal-safe libc functions.
pub trait ConfigTarget {
    /// Start a new session, detaching from the controlling terminal.
    fn setsid(&mut self) -> &mut Self;
    /// Cap the address space (MB) and disable core dumps.
    fn setlimit(&mut self, memlimit_mb: u64) -> &mut Self;
    /// Raise the descriptor limit enough for the reserved pipe fds.
    fn raise_fd_limit(&mut self) -> &mut Self;
    /// Clone the test-case descriptor onto stdin, or silence stdin.
    fn setstdin(&mut self, fd: RawFd, use_stdin: bool) -> &mut Self;
    /// Clone a descriptor to a well-known number in the child.
    fn setdupfd(&mut self, src: RawFd, dst: RawFd) -> &mut Self;
    /// Wire the control/status pipe ends to the reserved fd pair.
    fn setpipe(
        &mut self,
        st_read: RawFd,
        st_write: RawFd,
        ctl_read: RawFd,
        ctl_write: RawFd,
    ) -> &mut Self;
}

impl ConfigTarget for Command {
    fn setsid(&mut self) -> &mut Self {
        let func = move || {
            unsafe {
                libc::setsid();
            };
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setlimit(&mut self, memlimit_mb: u64) -> &mut Self {
        let func = move || {
            if memlimit_mb != 0 {
                let bytes: libc::rlim_t = (memlimit_mb as libc::rlim_t) << 20;
                let r = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                if unsafe { libc::setrlimit(libc::RLIMIT_AS, &r) } < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            // Core dumps are slow and can confuse crash accounting if
            // SIGKILL lands mid-dump.
            let r0 = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &r0) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn raise_fd_limit(&mut self) -> &mut Self {
        let func = move || {
            let mut r = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut r) } == 0
                && r.rlim_cur < (FORKSRV_FD + 2) as libc::rlim_t
            {
                r.rlim_cur = (FORKSRV_FD + 2) as libc::rlim_t;
                unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &r) };
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setstdin(&mut self, fd: RawFd, use_stdin: bool) -> &mut Self {
        if use_stdin {
            let func = move || {
                if dup2(fd, libc::STDIN_FILENO).is_err() {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            };
            unsafe { self.pre_exec(func) }
        } else {
            self.stdin(Stdio::null())
        }
    }

    fn setdupfd(&mut self, src: RawFd, dst: RawFd) -> &mut Self {
        let func = move || {
            if dup2(src, dst).is_err() {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                libc::close(src);
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setpipe(
        &mut self,
        st_read: RawFd,
        st_write: RawFd,
        ctl_read: RawFd,
        ctl_write: RawFd,
    ) -> &mut Self {
        let func = move || {
            if dup2(ctl_read, FORKSRV_FD).is_err() {
                return Err(io::Error::last_os_error());
            }
            if dup2(st_write, FORKSRV_FD + 1).is_err() {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                libc::close(st_read);
                libc::close(st_write);
                libc::close(ctl_read);
                libc::close(ctl_write);
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }
}

/// The environment every child gets: eager binding, and sane sanitizer
/// defaults unless the user already provided their own.
pub fn apply_child_env(command: &mut Command) {
    command.env("LD_BIND_NOW", "1");

    if std::env::var_os("ASAN_OPTIONS").is_none() {
        command.env(
            "ASAN_OPTIONS",
            "abort_on_error=1:detect_leaks=0:allocator_may_return_null=1",
        );
    }
    if std::env::var_os("MSAN_OPTIONS").is_none() {
        command.env(
            "MSAN_OPTIONS",
            format!("exit_code={MSAN_ERROR_CODE}:msan_track_origins=0"),
        );
    }
}

/// Dup the auxiliary code-block-info channel onto its reserved descriptor.
pub fn apply_aux_channel(command: &mut Command, aux_fd: RawFd) {
    command.setdupfd(aux_fd, CODE_BLOCK_INFO_FD);
}

/// Map a raw `wait()` status plus the surrounding facts to an outcome.
pub fn outcome_from_status(status: i32, timed_out: bool, uses_asan: bool) -> ExecOutcome {
    if timed_out {
        return ExecOutcome::Hang;
    }
    if libc::WIFSIGNALED(status) {
        return ExecOutcome::Crash {
            signal: libc::WTERMSIG(status),
        };
    }
    // MSAN cannot abort_on_error, so it exits with a designated code instead.
    if uses_asan && libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == MSAN_ERROR_CODE {
        return ExecOutcome::Crash { signal: 0 };
    }
    ExecOutcome::Ok
}

/// Zero the coverage map before an execution. The fence keeps the zeroing
/// from being reordered against the child's writes.
pub(crate) fn reset_trace(map: &mut UnixShMem) {
    use libafl_bolts::AsMutSlice;
    map.as_mut_slice().fill(0);
    fence(Ordering::SeqCst);
}

/// Read the first map word after an execution, fencing first so the read
/// cannot float above the status-pipe read.
pub(crate) fn trace_word0(map: &UnixShMem) -> u32 {
    use libafl_bolts::AsSlice;
    fence(Ordering::SeqCst);
    let bytes = map.as_slice();
    u32::from_ne_bytes(bytes[..4].try_into().unwrap())
}

/// Whether the map's first word carries the exec-through sentinel.
pub(crate) fn exec_failed(map: &UnixShMem) -> bool {
    trace_word0(map) == EXEC_FAIL_SIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaled_status_is_a_crash() {
        // Raw wait status for "killed by SIGSEGV".
        let status = libc::SIGSEGV;
        assert_eq!(
            outcome_from_status(status, false, false),
            ExecOutcome::Crash {
                signal: libc::SIGSEGV
            }
        );
    }

    #[test]
    fn timeout_wins_over_everything() {
        assert_eq!(
            outcome_from_status(libc::SIGKILL, true, false),
            ExecOutcome::Hang
        );
    }

    #[test]
    fn msan_exit_code_is_a_crash_only_under_sanitizers() {
        let status = (MSAN_ERROR_CODE) << 8; // WEXITSTATUS encoding
        assert_eq!(
            outcome_from_status(status, false, true),
            ExecOutcome::Crash { signal: 0 }
        );
        assert_eq!(outcome_from_status(status, false, false), ExecOutcome::Ok);
    }

    #[test]
    fn clean_exit_is_ok() {
        assert_eq!(outcome_from_status(0, false, false), ExecOutcome::Ok);
    }
}
