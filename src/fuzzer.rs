//! The campaign: one context owning every piece of run-lifetime state, the
//! outer sync cycle, and the two admission policies for executed inputs.
//!
//! The outer loop is deliberately small: enumerate siblings, replay their new
//! finds, refresh telemetry, re-cull the favored set, check for shutdown.
//! All mutation happens in the sibling fuzzers; our job is to judge and keep.

use std::time::Duration;

use libafl_bolts::Error;
use memmap2::Mmap;

use crate::{
    bitmap::{classify_counts, hash32, new_map, simplify_trace},
    calibrate::{calibrate_case, matches_mode},
    config::{Config, DumbMode, HASH_CONST, MAX_FILE, SYNC_MAX_SEEDS_PER, TRIM_MAX_LEN},
    coverage::{CoverageMaps, SeedRank, LEVEL_NEW_COVERAGE},
    executor::{ExecOutcome, TargetExecutor},
    persist::{self, OutputDirs},
    queue::Queue,
    signals::SessionFlags,
    stats::Stats,
    sync,
    triage::{TriageCollector, TriageRecord},
    trim::trim_case,
};

/// How an executed input earns a place in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Keep every execution that matches the sought outcome and rank it;
    /// the sync import path runs under this policy.
    ScoreEverything,
    /// Keep only executions whose classified trace clears the virgin map;
    /// used when replaying sibling crash stores.
    RequireNovelty,
}

/// Where an input under consideration came from.
#[derive(Debug, Clone, Copy)]
pub enum Origin<'a> {
    Local,
    Sync { peer: &'a str, case: u32 },
}

impl Origin<'_> {
    fn describe(&self) -> String {
        match self {
            Origin::Local => "local".to_string(),
            Origin::Sync { peer, .. } => (*peer).to_string(),
        }
    }

    /// The operation tag recorded in hang file names.
    fn op_tag(&self) -> String {
        match self {
            Origin::Local => "op:replay".to_string(),
            Origin::Sync { peer, case } => format!("sync:{peer},src:{case:08}"),
        }
    }
}

/// Everything a run owns. Dropping it tears the session down: the executor
/// kills its fork server, the shared map detaches, the directory lock lifts.
pub struct Campaign {
    pub cfg: Config,
    executor: Box<dyn TargetExecutor>,
    pub coverage: CoverageMaps,
    pub queue: Queue,
    pub stats: Stats,
    output: OutputDirs,
    triage: TriageCollector,
    flags: SessionFlags,
}

impl Campaign {
    pub fn new(
        cfg: Config,
        executor: Box<dyn TargetExecutor>,
        output: OutputDirs,
        flags: SessionFlags,
    ) -> Result<Self, Error> {
        let mut coverage = CoverageMaps::new();
        if let Some(bitmap) = &cfg.in_bitmap {
            coverage.load_virgin_bits(bitmap)?;
            log::info!("Seeded virgin map from {}", bitmap.display());
        }

        let triage = TriageCollector::new(&output.out_dir().join("triage_records"))?;

        Ok(Self {
            cfg,
            executor,
            coverage,
            queue: Queue::new(),
            stats: Stats::new(),
            output,
            triage,
            flags,
        })
    }

    /// The outer cycle, until a stop is requested.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            self.stats.queue_cycle += 1;
            log::info!(
                "Entering queue cycle {} ({} paths, {} favored, {} crashes)",
                self.stats.queue_cycle,
                self.queue.len(),
                self.queue.queued_favored,
                self.stats.unique_crashes
            );

            match self.sync_fuzzers() {
                Ok(()) => {}
                Err(Error::ShuttingDown) => break,
                Err(e) => return Err(e),
            }

            self.refresh_telemetry()?;

            if self.queue.cull() {
                self.output.update_cull_markers(&mut self.queue)?;
            }

            if self.flags.take_refresh() {
                log::info!(
                    "Status: {} paths ({} pending), {} favored, {} crashes, {} hangs, \
                     {} execs",
                    self.queue.len(),
                    self.queue.pending_not_fuzzed,
                    self.queue.queued_favored,
                    self.stats.unique_crashes,
                    self.stats.unique_hangs,
                    self.executor.executions()
                );
            }

            if self.flags.stop_requested() {
                break;
            }
        }

        self.shutdown()
    }

    /// One pass over every sibling in the sync root.
    fn sync_fuzzers(&mut self) -> Result<(), Error> {
        let (Some(sync_dir), Some(sync_id)) = (self.cfg.sync_dir.clone(), self.cfg.sync_id.clone())
        else {
            // Nothing feeds us; wait for a signal rather than spinning.
            std::thread::sleep(Duration::from_secs(5));
            return Ok(());
        };

        self.stats.sync_times += 1;

        let subdirs: &[(&str, AdmissionPolicy)] = if self.cfg.sync_crashes {
            &[
                ("queue", AdmissionPolicy::ScoreEverything),
                ("crashes", AdmissionPolicy::RequireNovelty),
            ]
        } else {
            &[("queue", AdmissionPolicy::ScoreEverything)]
        };

        for peer in sync::enumerate_peers(&sync_dir, &sync_id, &self.cfg.peer_prefix)? {
            let novel_peer = self
                .cfg
                .novel_peers
                .iter()
                .any(|prefix| peer.starts_with(prefix.as_str()));

            for &(subdir, policy) in subdirs {
                let cursor_path = self.output.sync_cursor_path(&peer, subdir)?;
                let min_accept = sync::read_cursor(&cursor_path);

                let scan = sync::scan_peer_dir(&sync_dir.join(&peer).join(subdir), min_accept)?;

                if novel_peer {
                    for stale in &scan.stale {
                        if let Err(e) = std::fs::remove_file(stale) {
                            log::warn!("Unable to remove consumed '{}': {e}", stale.display());
                        }
                    }
                }

                let cap = if subdir == "queue" {
                    SYNC_MAX_SEEDS_PER
                } else {
                    usize::MAX
                };
                let (batch, next_min_accept) = sync::select_batch(&scan.fresh, cap, min_accept);

                log::debug!(
                    "sync({peer}/{subdir}): {} fresh, taking {}",
                    scan.fresh.len(),
                    batch.len()
                );

                for entry in batch {
                    if self.flags.take_skip() {
                        log::info!("Skip requested, leaving the rest of {peer} for later");
                        break;
                    }

                    let mem = match map_candidate(&entry.path) {
                        Some(mem) => mem,
                        None => continue,
                    };

                    self.executor.write_input(&mem)?;
                    let outcome = self.run_target(self.cfg.exec_tmout)?;

                    let origin = Origin::Sync {
                        peer: &peer,
                        case: entry.id,
                    };
                    if self.save_if_interesting(policy, &mem, outcome, origin)? {
                        self.stats.queued_imported += 1;
                    }
                }

                sync::write_cursor(&cursor_path, next_min_accept)?;
            }
        }

        Ok(())
    }

    /// Run the target once, folding interrupted reads into the stop protocol.
    fn run_target(&mut self, timeout: Duration) -> Result<ExecOutcome, Error> {
        match self.executor.run(timeout) {
            Err(Error::Unknown(msg, _)) if msg.contains("EINTR") => {
                if self.flags.stop_requested() {
                    Err(Error::shutting_down())
                } else {
                    // Spurious wakeup; charge the input a fresh attempt.
                    self.executor.run(timeout)
                }
            }
            other => other,
        }
    }

    /// Route one executed input: queue admission, hang store, crash store.
    ///
    /// Returns whether the input was admitted to the queue.
    pub fn save_if_interesting(
        &mut self,
        policy: AdmissionPolicy,
        mem: &[u8],
        outcome: ExecOutcome,
        origin: Origin<'_>,
    ) -> Result<bool, Error> {
        if outcome == ExecOutcome::ExecError {
            return Err(Error::unknown("Unable to execute target application"));
        }

        // Rank against the global maps and take the classified checksum;
        // both policies share this prelude.
        let rank = self.coverage.rank_execution(self.executor.trace_bits());

        let mut classified = new_map();
        classified.copy_from_slice(self.executor.trace_bits());
        classify_counts(&mut classified);
        let cksum = hash32(&classified, HASH_CONST);
        self.coverage.note_path(cksum);

        let mut kept = false;

        if matches_mode(outcome, self.cfg.crash_mode) {
            let admit = match policy {
                AdmissionPolicy::ScoreEverything => true,
                AdmissionPolicy::RequireNovelty => {
                    self.coverage.check_virgin_bits(&classified) != 0
                }
            };
            if admit {
                kept = self.admit_to_queue(mem, rank, cksum, origin)?;
            }
        }

        match outcome {
            ExecOutcome::Hang => {
                self.stats.total_hangs += 1;

                // Hangs are only worth keeping when they reach edges no
                // other hang reached; presence is what matters, not counts.
                let mut simplified = classified;
                simplified.copy_from_slice(self.executor.trace_bits());
                simplify_trace(&mut simplified);
                if self.coverage.check_virgin_hang(&simplified) != 0 {
                    let fname = self
                        .output
                        .hang_entry_path(self.stats.unique_hangs, &origin.op_tag());
                    persist::write_testcase(&fname, mem)?;
                    self.stats.note_hang();
                    self.triage.append(&TriageRecord::new(
                        outcome,
                        &origin.describe(),
                        &fname,
                        rank.score,
                        rank.level,
                        cksum,
                    ))?;
                    log::info!("New hang saved as {}", fname.display());
                }
            }
            ExecOutcome::Crash { signal } => {
                self.stats.total_crashes += 1;

                let unique = match policy {
                    AdmissionPolicy::ScoreEverything => true,
                    AdmissionPolicy::RequireNovelty => {
                        let mut simplified = classified;
                        simplified.copy_from_slice(self.executor.trace_bits());
                        simplify_trace(&mut simplified);
                        self.coverage.check_virgin_crash(&simplified) != 0
                    }
                };
                if unique {
                    if self.stats.unique_crashes == 0 {
                        self.output.write_crash_readme(&self.cfg);
                    }
                    let fname = self.output.crash_entry_path(
                        self.stats.unique_crashes,
                        rank.score,
                        rank.level,
                        signal,
                    );
                    persist::write_testcase(&fname, mem)?;
                    self.stats.note_crash();
                    self.triage.append(&TriageRecord::new(
                        outcome,
                        &origin.describe(),
                        &fname,
                        rank.score,
                        rank.level,
                        cksum,
                    ))?;
                    log::info!("New crash saved as {} (signal {signal})", fname.display());
                }
            }
            _ => {}
        }

        Ok(kept)
    }

    /// Add an input to the queue: optional trim, calibration, persistence.
    fn admit_to_queue(
        &mut self,
        mem: &[u8],
        rank: SeedRank,
        cksum: u32,
        origin: Origin<'_>,
    ) -> Result<bool, Error> {
        let mut data = mem.to_vec();

        if self.cfg.trim_cases
            && self.cfg.dumb_mode == DumbMode::Off
            && data.len() <= TRIM_MAX_LEN
        {
            trim_case(&mut *self.executor, &mut data, cksum, self.cfg.exec_tmout)?;
        }

        let fname = self
            .output
            .queue_entry_path(self.queue.len() as u32, rank.score, rank.level);
        // With deterministic stages skipped globally, entries are born with
        // them considered done.
        let id = self
            .queue
            .add(fname.clone(), data.len(), self.cfg.skip_deterministic);
        self.stats.current_entry = id.0 as u32;

        if rank.level == LEVEL_NEW_COVERAGE {
            self.queue.mark_new_cov(id);
        }
        self.queue.get_mut(id).exec_cksum = cksum;
        if self.cfg.trim_cases {
            self.queue.get_mut(id).trim_done = true;
        }

        if self.cfg.dumb_mode == DumbMode::Off {
            let cal = calibrate_case(
                &mut *self.executor,
                &mut self.queue,
                id,
                &mut self.coverage,
                &data,
                self.stats.queue_cycle.saturating_sub(1) as u32,
                !matches!(origin, Origin::Sync { .. }),
                &self.cfg,
            )?;

            match cal.outcome {
                ExecOutcome::ExecError => {
                    return Err(Error::unknown("Unable to execute target application"));
                }
                ExecOutcome::NoInstrumentation => {
                    log::warn!("Calibration saw no instrumentation output");
                }
                ExecOutcome::NoBits => {
                    log::debug!("No new instrumentation output during calibration");
                }
                _ => {}
            }

            if cal.newly_variable {
                self.output.mark_variable_on_disk(&fname)?;
                log::info!("Variable behavior detected for {}", fname.display());
            }
        }

        persist::write_testcase(&fname, &data)?;
        self.stats.note_new_path();
        log::debug!(
            "Queued {} (score {:.5}, level {})",
            fname.display(),
            rank.score,
            rank.level
        );

        Ok(true)
    }

    /// Rewrite `fuzzer_stats`, append to `plot_data`, snapshot the bitmap.
    fn refresh_telemetry(&mut self) -> Result<(), Error> {
        let execs = self.executor.executions();
        let eps = self.stats.execs_per_sec(execs);
        let cvg = self.coverage.bitmap_coverage();

        self.stats.write_stats_file(
            &self.output.stats_path(),
            &self.cfg,
            &self.queue,
            execs,
            cvg,
            eps,
        )?;
        self.stats
            .maybe_update_plot(&mut self.output.plot_file, &self.queue, cvg, eps)?;
        self.coverage
            .write_virgin_bits(&self.output.fuzz_bitmap_path())?;
        Ok(())
    }

    /// Final snapshots, then let the drops run.
    fn shutdown(&mut self) -> Result<(), Error> {
        log::info!("+++ Testing aborted by user +++");
        self.refresh_telemetry()?;
        log::info!("We're done here. Have a nice day!");
        Ok(())
    }
}

/// Map a sync candidate read-only; odd sizes and unreadable files are
/// cooperative-class errors, logged and skipped.
fn map_candidate(path: &std::path::Path) -> Option<Mmap> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("Unable to open sync candidate '{}': {e}", path.display());
            return None;
        }
    };
    let len = file.metadata().ok()?.len() as usize;
    if len == 0 || len > MAX_FILE {
        log::debug!("Ignoring '{}' ({} bytes)", path.display(), len);
        return None;
    }
    match unsafe { Mmap::map(&file) } {
        Ok(mem) => Some(mem),
        Err(e) => {
            log::warn!("Unable to map sync candidate '{}': {e}", path.display());
            None
        }
    }
}
