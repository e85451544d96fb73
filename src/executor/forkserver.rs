//! The persistent fork-server client.
//!
//! The target is spawned once with its control/status descriptors wired to a
//! reserved fd pair. The instrumented startup code inside the target forks a
//! fresh copy per request, so we pay linker and initializer cost a single
//! time. Each execution is one round trip: a 4-byte request on the control
//! pipe, the child PID and then the wait status back on the status pipe.

use std::{
    ffi::OsString,
    io::{self, prelude::*, ErrorKind},
    os::unix::io::{AsRawFd, BorrowedFd},
    path::PathBuf,
    process::{Child, Command},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use libafl_bolts::{os::pipes::Pipe, shmem::UnixShMem, AsSlice, Error};
use nix::{
    sys::{
        select::{pselect, FdSet},
        signal::{kill, SigSet, Signal},
        time::TimeSpec,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use super::{
    apply_aux_channel, apply_child_env, exec_failed, outcome_from_status, reset_trace,
    ChildSinks, ConfigTarget, ExecOutcome, TargetExecutor, TestcaseFile,
};
use crate::{bolts::timeout_error, config::Config};

/// Grace period for control-plane pipe traffic that should be instantaneous.
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// How the target process is brought up, shared with the dumb driver.
#[derive(Debug)]
pub struct TargetSpawn {
    /// Absolute path of the binary (or the emulator, in `-Q` mode).
    pub program: PathBuf,
    /// Argv after the program name, `@@` already substituted.
    pub args: Vec<OsString>,
    /// Memory cap in MB, zero meaning none.
    pub mem_limit_mb: u64,
    /// Where the emulator log goes, if `-L` was given.
    pub qemu_log: Option<PathBuf>,
    /// Descriptor of the auxiliary code-block-info file.
    pub aux_fd: i32,
}

impl TargetSpawn {
    /// A command with the full child prelude applied, pipes excluded.
    pub(super) fn command(&self, testcase: &TestcaseFile) -> Result<Command, Error> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);

        let sinks = match &self.qemu_log {
            Some(path) => ChildSinks::StderrTo(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => ChildSinks::Quiet,
        };
        sinks.apply(&mut command);

        apply_child_env(&mut command);
        apply_aux_channel(&mut command, self.aux_fd);

        command
            .setsid()
            .setlimit(self.mem_limit_mb)
            .raise_fd_limit()
            .setstdin(testcase.as_raw_fd(), testcase.feeds_stdin());

        Ok(command)
    }
}

/// The communication channel with the fork server running inside the target.
#[derive(Debug)]
pub struct Forkserver {
    /// The spawned target hosting the fork server.
    fsrv_handle: Child,
    /// Status pipe, child to us.
    st_pipe: Pipe,
    /// Control pipe, us to child.
    ctl_pipe: Pipe,
    /// Pid of the currently forked child, while an exec is in flight.
    child_pid: Option<Pid>,
    /// Last wait status the fork server reported.
    status: i32,
}

impl Forkserver {
    /// Spawn the target with the pipe pair wired to the reserved fds.
    pub fn spawn(spawn: &TargetSpawn, testcase: &TestcaseFile) -> Result<Self, Error> {
        let mut st_pipe = Pipe::new()?;
        let mut ctl_pipe = Pipe::new()?;

        let mut command = spawn.command(testcase)?;
        command.setpipe(
            st_pipe.read_end().unwrap(),
            st_pipe.write_end().unwrap(),
            ctl_pipe.read_end().unwrap(),
            ctl_pipe.write_end().unwrap(),
        );

        let fsrv_handle = command.spawn().map_err(|err| {
            Error::illegal_state(format!("Could not spawn the fork server: {err:#?}"))
        })?;

        // The parent keeps only its own ends.
        ctl_pipe.close_read_end();
        st_pipe.close_write_end();

        Ok(Self {
            fsrv_handle,
            st_pipe,
            ctl_pipe,
            child_pid: None,
            status: 0,
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.fsrv_handle.id() as i32)
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    /// Kill the currently forked child, if any.
    pub fn kill_child(&self) {
        if let Some(pid) = self.child_pid {
            let _ = kill(pid, Signal::SIGKILL);
        }
    }

    /// Read a 4-byte message from the status pipe, waiting at most `timeout`.
    /// `Ok(None)` means the deadline passed.
    pub fn read_st_timed(&mut self, timeout: &TimeSpec) -> Result<Option<i32>, Error> {
        let mut buf = [0u8; 4];
        let Some(st_read) = self.st_pipe.read_end() else {
            return Err(Error::file(io::Error::new(
                ErrorKind::BrokenPipe,
                "Status pipe read end was already closed",
            )));
        };

        // The fd stays open for as long as the pipe lives.
        let st_read = unsafe { BorrowedFd::borrow_raw(st_read) };

        let mut readfds = FdSet::new();
        readfds.insert(&st_read);
        let sret = pselect(
            Some(readfds.highest().unwrap().as_raw_fd() + 1),
            &mut readfds,
            None,
            None,
            Some(timeout),
            Some(&SigSet::empty()),
        )
        .map_err(|e| Error::illegal_state(format!("pselect failed: {e}")))?;
        if sret > 0 {
            if self.st_pipe.read_exact(&mut buf).is_ok() {
                Ok(Some(i32::from_ne_bytes(buf)))
            } else {
                Err(Error::unknown(
                    "Unable to communicate with (read from) fork server (OOM?)".to_string(),
                ))
            }
        } else {
            Ok(None)
        }
    }

    /// Write a 4-byte message to the control pipe, waiting at most `timeout`
    /// for it to become writable. `Ok(None)` means the deadline passed.
    pub fn write_ctl_timed(&mut self, val: i32, timeout: &TimeSpec) -> Result<Option<usize>, Error> {
        let Some(ctl_write) = self.ctl_pipe.write_end() else {
            return Err(Error::file(io::Error::new(
                ErrorKind::BrokenPipe,
                "Control pipe write end was already closed",
            )));
        };

        // The fd stays open for as long as the pipe lives.
        let ctl_write = unsafe { BorrowedFd::borrow_raw(ctl_write) };

        let mut writefds = FdSet::new();
        writefds.insert(&ctl_write);
        let sret = pselect(
            Some(writefds.highest().unwrap().as_raw_fd() + 1),
            None,
            &mut writefds,
            None,
            Some(timeout),
            Some(&SigSet::empty()),
        )
        .map_err(|e| Error::illegal_state(format!("pselect failed: {e}")))?;

        let slen = if sret > 0 {
            Some(self.ctl_pipe.write(&val.to_ne_bytes())?)
        } else {
            None
        };
        Ok(slen)
    }
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        log::debug!("Dropping fork server");

        self.kill_child();

        let forkserver_pid = self.pid();
        if let Err(err) = kill(forkserver_pid, Signal::SIGKILL) {
            log::warn!("Failed to deliver kill signal to fork server {forkserver_pid}: {err}");
        } else if let Err(err) = waitpid(forkserver_pid, None) {
            log::warn!("Waitpid on fork server {forkserver_pid} failed: {err}");
        }
    }
}

/// [`TargetExecutor`] backed by a [`Forkserver`].
pub struct ForkserverExecutor {
    forkserver: Forkserver,
    map: UnixShMem,
    testcase: TestcaseFile,
    stop: Arc<AtomicBool>,
    uses_asan: bool,
    execs: u64,
}

impl ForkserverExecutor {
    /// Spawn the target and complete the bring-up handshake.
    ///
    /// Waits up to the exec timeout times the fork-wait multiplier for the
    /// 4-byte hello; any other outcome is fatal and diagnosed as well as
    /// possible.
    pub fn start(
        spawn: &TargetSpawn,
        mut map: UnixShMem,
        testcase: TestcaseFile,
        stop: Arc<AtomicBool>,
        cfg: &Config,
        uses_asan: bool,
    ) -> Result<Self, Error> {
        log::info!("Spinning up the fork server");

        reset_trace(&mut map);
        let mut forkserver = Forkserver::spawn(spawn, &testcase)?;

        let wait = TimeSpec::from_duration(cfg.fork_wait_timeout());
        match forkserver.read_st_timed(&wait) {
            Ok(Some(_hello)) => {
                log::info!("All right - fork server is up.");
                Ok(Self {
                    forkserver,
                    map,
                    testcase,
                    stop,
                    uses_asan,
                    execs: 0,
                })
            }
            Ok(None) => Err(Error::unknown(
                "Timeout while initializing fork server (adjusting -t may help)",
            )),
            Err(err) => {
                if stop.load(Ordering::Relaxed) {
                    return Err(Error::shutting_down());
                }
                Err(Self::diagnose_failed_handshake(
                    &mut forkserver,
                    &map,
                    cfg,
                    uses_asan,
                    err,
                ))
            }
        }
    }

    /// Work out why the hello never arrived.
    fn diagnose_failed_handshake(
        forkserver: &mut Forkserver,
        map: &UnixShMem,
        cfg: &Config,
        uses_asan: bool,
        err: Error,
    ) -> Error {
        if let Ok(WaitStatus::Signaled(_, signal, _)) =
            waitpid(forkserver.pid(), Some(WaitPidFlag::WUNTRACED))
        {
            if cfg.mem_limit_mb != 0 && cfg.mem_limit_mb < 500 && uses_asan {
                log::error!(
                    "The target crashed before receiving any input. It seems to be built \
                     with ASAN under a restrictive memory limit; raise it with -m."
                );
            } else if cfg.mem_limit_mb != 0 {
                log::error!(
                    "The target crashed before receiving any input. The current memory \
                     limit ({} MB) may be too restrictive for the dynamic linker; try a \
                     higher -m, or the target may simply be broken.",
                    cfg.mem_limit_mb
                );
            } else {
                log::error!(
                    "The target crashed before receiving any input; it seems to be \
                     broken on its own."
                );
            }
            return Error::unknown(format!("Fork server crashed with signal {signal}"));
        }

        if exec_failed(map) {
            return Error::unknown(format!(
                "Unable to execute target application ('{}')",
                cfg.target_path.display()
            ));
        }

        log::error!(
            "The target terminated before completing the handshake with the injected \
             code; a too-low memory limit (-m) is the usual cause. ({err})"
        );
        Error::unknown("Fork server handshake failed")
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

impl TargetExecutor for ForkserverExecutor {
    fn write_input(&mut self, input: &[u8]) -> Result<(), Error> {
        self.testcase.write(input)
    }

    fn run(&mut self, timeout: Duration) -> Result<ExecOutcome, Error> {
        if self.stopped() {
            return Err(Error::shutting_down());
        }

        reset_trace(&mut self.map);

        let grace = TimeSpec::from_duration(PIPE_GRACE);

        let send_len = self
            .forkserver
            .write_ctl_timed(0, &grace)?
            .ok_or_else(|| timeout_error("Could not write to fork server"))?;
        if send_len != 4 {
            return Err(Error::unknown(
                "Unable to request new process from fork server (OOM?)".to_string(),
            ));
        }

        let pid = self
            .forkserver
            .read_st_timed(&grace)?
            .ok_or_else(|| timeout_error("Could not read PID from fork server"))?;
        if pid <= 0 {
            return Err(Error::unknown(
                "Fork server is misbehaving (OOM?)".to_string(),
            ));
        }
        self.forkserver.child_pid = Some(Pid::from_raw(pid));

        let mut timed_out = false;
        let deadline = TimeSpec::from_duration(timeout);
        match self.forkserver.read_st_timed(&deadline)? {
            Some(status) => {
                self.forkserver.status = status;
            }
            None => {
                // Budget exhausted: put the child down, then collect the
                // status the fork server reports for it.
                timed_out = true;
                self.forkserver.kill_child();
                match self.forkserver.read_st_timed(&grace)? {
                    Some(status) => self.forkserver.status = status,
                    None => {
                        if self.stopped() {
                            return Err(Error::shutting_down());
                        }
                        return Err(timeout_error(
                            "Could not read from fork server after timeout; it looks stuck",
                        ));
                    }
                }
            }
        }
        self.forkserver.child_pid = None;
        self.execs += 1;

        if self.stopped() {
            return Err(Error::shutting_down());
        }

        if exec_failed(&self.map) {
            return Ok(ExecOutcome::ExecError);
        }

        Ok(outcome_from_status(
            self.forkserver.status(),
            timed_out,
            self.uses_asan,
        ))
    }

    fn trace_bits(&self) -> &[u8] {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        self.map.as_slice()
    }

    fn executions(&self) -> u64 {
        self.execs
    }
}
