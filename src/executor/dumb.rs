//! Fork/exec-per-input fallback.
//!
//! Used when the target carries no fork server (`-n`) or the user disabled
//! it (`AFL_NO_FORKSRV`). Every execution spawns a fresh child through the
//! same prelude the fork-server path uses; the rest of the pipeline does not
//! notice the difference.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use libafl_bolts::{shmem::UnixShMem, AsSlice, Error};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use super::{
    forkserver::TargetSpawn, outcome_from_status, reset_trace, ExecOutcome, TargetExecutor,
    TestcaseFile,
};

/// How often the child is polled while we wait out the exec budget.
const WAIT_POLL: Duration = Duration::from_millis(1);

/// [`TargetExecutor`] that pays the full spawn cost on every input.
pub struct DumbExecutor {
    spawn: TargetSpawn,
    map: UnixShMem,
    testcase: TestcaseFile,
    stop: Arc<AtomicBool>,
    uses_asan: bool,
    execs: u64,
}

impl DumbExecutor {
    pub fn new(
        spawn: TargetSpawn,
        map: UnixShMem,
        testcase: TestcaseFile,
        stop: Arc<AtomicBool>,
        uses_asan: bool,
    ) -> Self {
        Self {
            spawn,
            map,
            testcase,
            stop,
            uses_asan,
            execs: 0,
        }
    }

    /// Reap the child, killing it once the deadline passes.
    fn wait_with_deadline(&self, pid: Pid, timeout: Duration) -> Result<(i32, bool), Error> {
        let started = Instant::now();

        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG))
                .map_err(|e| Error::illegal_state(format!("waitpid failed: {e}")))?
            {
                WaitStatus::StillAlive => {}
                WaitStatus::Exited(_, code) => return Ok((code << 8, false)),
                WaitStatus::Signaled(_, signal, _) => return Ok((signal as i32, false)),
                other => {
                    log::debug!("Unexpected wait status {other:?}, keeping on waiting");
                }
            }

            if self.stop.load(Ordering::Relaxed) {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                return Err(Error::shutting_down());
            }

            if started.elapsed() >= timeout {
                let _ = kill(pid, Signal::SIGKILL);
                let status = match waitpid(pid, None)
                    .map_err(|e| Error::illegal_state(format!("waitpid failed: {e}")))?
                {
                    WaitStatus::Signaled(_, signal, _) => signal as i32,
                    WaitStatus::Exited(_, code) => code << 8,
                    _ => 0,
                };
                return Ok((status, true));
            }

            std::thread::sleep(WAIT_POLL);
        }
    }
}

impl TargetExecutor for DumbExecutor {
    fn write_input(&mut self, input: &[u8]) -> Result<(), Error> {
        self.testcase.write(input)
    }

    fn run(&mut self, timeout: Duration) -> Result<ExecOutcome, Error> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(Error::shutting_down());
        }

        reset_trace(&mut self.map);

        let child = self
            .spawn
            .command(&self.testcase)?
            .spawn()
            .map_err(|err| Error::illegal_state(format!("Could not spawn the target: {err}")))?;
        let pid = Pid::from_raw(child.id() as i32);

        let (status, timed_out) = self.wait_with_deadline(pid, timeout)?;
        self.execs += 1;

        if super::exec_failed(&self.map) {
            return Ok(ExecOutcome::ExecError);
        }

        Ok(outcome_from_status(status, timed_out, self.uses_asan))
    }

    fn trace_bits(&self) -> &[u8] {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        self.map.as_slice()
    }

    fn executions(&self) -> u64 {
        self.execs
    }
}
