//! Calibration of freshly added queue entries.
//!
//! A new entry is executed several times to establish whether its trace
//! checksum is stable, how long an execution takes on average, and how much
//! of the map it populates. Diverging checksums flip the entry to
//! variable-behavior and stretch the measurement window.

use std::time::Duration;

use libafl_bolts::Error;

use crate::{
    bitmap::{self, classify_counts, count_bytes},
    bolts::current_micros,
    config::{Config, DumbMode, HASH_CONST, CAL_CYCLES, CAL_CYCLES_LONG, CAL_CYCLES_NO_VAR},
    coverage::CoverageMaps,
    executor::{ExecOutcome, TargetExecutor},
    queue::{EntryId, Queue},
};

/// What calibration concluded about an entry.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    /// `Ok` on success; `NoInstrumentation`, `NoBits`, or the aborting fault.
    pub outcome: ExecOutcome,
    /// Strongest novelty seen across the cycles (see `bitmap::has_new_bits`).
    pub new_bits: u8,
    /// The entry was flagged variable-behavior by this calibration.
    pub newly_variable: bool,
}

/// Whether an outcome is the one the campaign is hunting for.
///
/// In crash-exploration mode crashes are the expected result and everything
/// else aborts calibration, mirroring the normal mode's treatment of faults.
pub fn matches_mode(outcome: ExecOutcome, crash_mode: bool) -> bool {
    if crash_mode {
        outcome.is_crash()
    } else {
        outcome == ExecOutcome::Ok
    }
}

/// Execute the entry `CAL_CYCLES` times (more on suspected variance) and fill
/// in its measured fields. Never called in dumb mode.
pub fn calibrate_case<E: TargetExecutor + ?Sized>(
    executor: &mut E,
    queue: &mut Queue,
    id: EntryId,
    coverage: &mut CoverageMaps,
    input: &[u8],
    handicap: u32,
    from_queue: bool,
    cfg: &Config,
) -> Result<Calibration, Error> {
    debug_assert!(cfg.dumb_mode == DumbMode::Off);

    let first_run = queue.get(id).exec_cksum == 0;
    let mut new_bits = 0u8;
    let mut var_detected = false;
    let mut outcome = ExecOutcome::Ok;

    queue.get_mut(id).cal_failed += 1;

    // Imported entries get a wider budget; intermittent latency on the
    // first replays should not condemn them.
    let timeout: Duration = if from_queue {
        cfg.exec_tmout
    } else {
        cfg.calibration_tmout()
    };

    let mut stage_max = if cfg.no_var_check {
        CAL_CYCLES_NO_VAR
    } else {
        CAL_CYCLES
    };

    let mut classified = bitmap::new_map();
    let start_us = current_micros();
    let mut stage_cur = 0u32;

    while stage_cur < stage_max {
        executor.write_input(input)?;
        outcome = executor.run(timeout)?;

        if !matches_mode(outcome, cfg.crash_mode) {
            break;
        }

        if stage_cur == 0 && count_bytes(executor.trace_bits()) == 0 {
            outcome = ExecOutcome::NoInstrumentation;
            break;
        }

        classified.copy_from_slice(executor.trace_bits());
        classify_counts(&mut classified);
        let cksum = bitmap::hash32(&classified, HASH_CONST);

        if queue.get(id).exec_cksum != cksum {
            let hnb = coverage.check_virgin_bits(&classified);
            if hnb > new_bits {
                new_bits = hnb;
            }

            if !cfg.no_var_check && queue.get(id).exec_cksum != 0 {
                var_detected = true;
                stage_max = CAL_CYCLES_LONG;
            } else {
                queue.get_mut(id).exec_cksum = cksum;
            }
        }

        stage_cur += 1;
    }

    let stop_us = current_micros();

    let aborted = !matches_mode(outcome, cfg.crash_mode)
        || outcome == ExecOutcome::NoInstrumentation;

    if !aborted {
        let entry = queue.get_mut(id);
        entry.exec_us = (stop_us - start_us) / u64::from(stage_max);
        entry.bitmap_size = count_bytes(executor.trace_bits());
        entry.handicap = handicap;
        entry.cal_failed = 0;

        queue.update_bitmap_score(id, executor.trace_bits(), |cksum| {
            coverage.path_count(cksum)
        });

        // A clean first calibration that taught us nothing is worth telling
        // the caller about.
        if first_run && outcome == ExecOutcome::Ok && new_bits == 0 {
            outcome = ExecOutcome::NoBits;
        }
    }

    if new_bits == 2 {
        queue.mark_new_cov(id);
    }

    let newly_variable = var_detected && queue.mark_variable(id);

    Ok(Calibration {
        outcome,
        new_bits,
        newly_variable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bitmap::new_map, executor::ExecOutcome};
    use std::path::PathBuf;

    /// Scripted stand-in for the real target drivers.
    struct ScriptedExecutor {
        traces: Vec<Vec<u8>>,
        cursor: usize,
        execs: u64,
    }

    impl ScriptedExecutor {
        fn cycling(traces: Vec<Vec<u8>>) -> Self {
            Self {
                traces,
                cursor: 0,
                execs: 0,
            }
        }
    }

    impl TargetExecutor for ScriptedExecutor {
        fn write_input(&mut self, _input: &[u8]) -> Result<(), Error> {
            Ok(())
        }

        fn run(&mut self, _timeout: Duration) -> Result<ExecOutcome, Error> {
            self.cursor = (self.execs as usize) % self.traces.len();
            self.execs += 1;
            Ok(ExecOutcome::Ok)
        }

        fn trace_bits(&self) -> &[u8] {
            &self.traces[self.cursor]
        }

        fn executions(&self) -> u64 {
            self.execs
        }
    }

    fn test_config() -> Config {
        Config {
            out_dir: PathBuf::from("/nonexistent"),
            sync_dir: None,
            sync_id: None,
            force_deterministic: false,
            skip_deterministic: false,
            out_file: None,
            exec_tmout: Duration::from_millis(1000),
            timeout_is_hard: false,
            mem_limit_mb: 0,
            qemu_mode: false,
            qemu_log: false,
            dumb_mode: DumbMode::Off,
            no_forkserver: false,
            no_var_check: false,
            skip_bin_check: true,
            crash_mode: false,
            banner: "test".into(),
            in_bitmap: None,
            trim_cases: false,
            peer_prefix: String::new(),
            novel_peers: Vec::new(),
            sync_crashes: false,
            target_path: PathBuf::from("/bin/true"),
            target_args: Vec::new(),
            orig_cmdline: String::new(),
        }
    }

    #[test]
    fn stable_entry_keeps_its_checksum() {
        let mut trace = new_map();
        trace[10] = 1;
        let mut executor = ScriptedExecutor::cycling(vec![trace]);

        let mut queue = Queue::new();
        let id = queue.add(PathBuf::from("seed"), 4, false);
        let mut coverage = CoverageMaps::new();
        let cfg = test_config();

        let cal = calibrate_case(
            &mut executor,
            &mut queue,
            id,
            &mut coverage,
            b"data",
            0,
            false,
            &cfg,
        )
        .unwrap();

        assert_eq!(cal.new_bits, 2);
        assert!(!cal.newly_variable);
        assert_ne!(queue.get(id).exec_cksum, 0);
        assert_eq!(queue.get(id).bitmap_size, 1);
        assert_eq!(executor.executions(), u64::from(CAL_CYCLES));
        assert!(queue.get(id).has_new_cov);
    }

    #[test]
    fn diverging_checksums_flag_variable_behavior() {
        let mut a = new_map();
        a[1] = 1;
        let mut b = new_map();
        b[2] = 1;
        let mut executor = ScriptedExecutor::cycling(vec![a, b]);

        let mut queue = Queue::new();
        let id = queue.add(PathBuf::from("flaky"), 4, false);
        let mut coverage = CoverageMaps::new();
        let cfg = test_config();

        let cal = calibrate_case(
            &mut executor,
            &mut queue,
            id,
            &mut coverage,
            b"data",
            0,
            false,
            &cfg,
        )
        .unwrap();

        assert!(cal.newly_variable);
        assert!(queue.get(id).var_behavior);
        assert_eq!(queue.queued_variable, 1);
        assert_eq!(executor.executions(), u64::from(CAL_CYCLES_LONG));
    }

    #[test]
    fn uninstrumented_target_is_reported() {
        let mut executor = ScriptedExecutor::cycling(vec![new_map()]);

        let mut queue = Queue::new();
        let id = queue.add(PathBuf::from("seed"), 4, false);
        let mut coverage = CoverageMaps::new();
        let cfg = test_config();

        let cal = calibrate_case(
            &mut executor,
            &mut queue,
            id,
            &mut coverage,
            b"data",
            0,
            false,
            &cfg,
        )
        .unwrap();

        assert_eq!(cal.outcome, ExecOutcome::NoInstrumentation);
    }

    #[test]
    fn known_coverage_reports_no_bits() {
        let mut trace = new_map();
        trace[10] = 1;

        let mut coverage = CoverageMaps::new();
        // Pre-claim the edge so calibration cannot find anything new.
        let mut classified = trace.clone();
        classify_counts(&mut classified);
        coverage.check_virgin_bits(&classified);

        let mut executor = ScriptedExecutor::cycling(vec![trace]);
        let mut queue = Queue::new();
        let id = queue.add(PathBuf::from("seed"), 4, false);
        let cfg = test_config();

        let cal = calibrate_case(
            &mut executor,
            &mut queue,
            id,
            &mut coverage,
            b"data",
            0,
            false,
            &cfg,
        )
        .unwrap();

        assert_eq!(cal.outcome, ExecOutcome::NoBits);
    }
}
