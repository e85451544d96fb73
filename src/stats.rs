//! Session counters and the two telemetry files external tooling consumes:
//! the `fuzzer_stats` key/value snapshot and the `plot_data` CSV.

use std::{fs::File, io::Write, path::Path};

use libafl_bolts::Error;

use crate::{bolts::current_millis, config::Config, queue::Queue};

/// Campaign-level counters, updated as the run progresses.
#[derive(Debug, Default)]
pub struct Stats {
    /// Wall clock at campaign start, milliseconds.
    pub start_time_ms: u64,
    /// Completed passes over the sync root.
    pub queue_cycle: u64,
    /// Entries imported from siblings.
    pub queued_imported: u32,
    /// Entries discovered locally (always 0 without local mutation stages).
    pub queued_discovered: u32,
    /// Index of the entry currently under examination.
    pub current_entry: u32,
    /// Crashing inputs persisted.
    pub unique_crashes: u64,
    /// Hanging inputs persisted.
    pub unique_hangs: u64,
    /// All crashing executions, persisted or not.
    pub total_crashes: u64,
    /// All hanging executions.
    pub total_hangs: u64,
    /// Wall clock of the first persisted crash, milliseconds.
    pub first_crash_time_ms: u64,
    /// Wall clock of the latest persisted crash, milliseconds.
    pub last_crash_time_ms: u64,
    /// Wall clock of the latest hang, milliseconds.
    pub last_hang_time_ms: u64,
    /// Wall clock of the latest queue addition, milliseconds.
    pub last_path_time_ms: u64,
    /// Sync passes performed.
    pub sync_times: u64,

    // Last written plot row, to suppress no-change rows.
    plot_prev: Option<PlotRow>,
    // Carried stats for contexts where rates are not recomputed.
    last_bitmap_cvg: f64,
    last_eps: f64,
}

#[derive(Debug, PartialEq, Clone, Copy)]
struct PlotRow {
    cycles: u64,
    cur_path: u32,
    paths_total: usize,
    pending: u32,
    pending_favs: u32,
    crashes: u64,
    hangs: u64,
    max_depth: u32,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start_time_ms: current_millis(),
            ..Self::default()
        }
    }

    pub fn note_crash(&mut self) {
        let now = current_millis();
        if self.unique_crashes == 0 {
            self.first_crash_time_ms = now;
        }
        self.unique_crashes += 1;
        self.last_crash_time_ms = now;
    }

    pub fn note_hang(&mut self) {
        self.unique_hangs += 1;
        self.last_hang_time_ms = current_millis();
    }

    pub fn note_new_path(&mut self) {
        self.last_path_time_ms = current_millis();
    }

    /// Executions per second since campaign start.
    pub fn execs_per_sec(&self, total_execs: u64) -> f64 {
        let elapsed_ms = current_millis().saturating_sub(self.start_time_ms);
        if elapsed_ms == 0 {
            return 0.0;
        }
        total_execs as f64 * 1000.0 / elapsed_ms as f64
    }

    /// Rewrite `fuzzer_stats` in full.
    pub fn write_stats_file(
        &mut self,
        path: &Path,
        cfg: &Config,
        queue: &Queue,
        total_execs: u64,
        bitmap_cvg: f64,
        eps: f64,
    ) -> Result<(), Error> {
        // Keep the last rates around for callers that cannot recompute them.
        let (bitmap_cvg, eps) = if bitmap_cvg == 0.0 && eps == 0.0 {
            (self.last_bitmap_cvg, self.last_eps)
        } else {
            self.last_bitmap_cvg = bitmap_cvg;
            self.last_eps = eps;
            (bitmap_cvg, eps)
        };

        let mut f = File::create(path)?;
        let mut field = |key: &str, value: String| writeln!(f, "{key:<22}: {value}");

        field("start_time", (self.start_time_ms / 1000).to_string())?;
        field("last_update", (current_millis() / 1000).to_string())?;
        field("fuzzer_pid", std::process::id().to_string())?;
        field(
            "first_crash_time",
            (self.first_crash_time_ms / 1000).to_string(),
        )?;
        field(
            "last_crash_time",
            (self.last_crash_time_ms / 1000).to_string(),
        )?;
        field("cycles_done", self.queue_cycle.saturating_sub(1).to_string())?;
        field("execs_done", total_execs.to_string())?;
        field("execs_per_sec", format!("{eps:.2}"))?;
        field("paths_total", queue.len().to_string())?;
        field("paths_found", self.queued_discovered.to_string())?;
        field("paths_imported", self.queued_imported.to_string())?;
        field("max_depth", queue.max_depth.to_string())?;
        field("cur_path", self.current_entry.to_string())?;
        field("pending_favs", queue.pending_favored.to_string())?;
        field("pending_total", queue.pending_not_fuzzed.to_string())?;
        field("variable_paths", queue.queued_variable.to_string())?;
        field("bitmap_cvg", format!("{bitmap_cvg:.2}%"))?;
        field("unique_crashes", self.unique_crashes.to_string())?;
        field("unique_hangs", self.unique_hangs.to_string())?;
        field("sync_times", self.sync_times.to_string())?;
        field("afl_banner", cfg.banner.clone())?;
        field("afl_version", env!("CARGO_PKG_VERSION").to_string())?;
        field("command_line", cfg.orig_cmdline.clone())?;

        Ok(())
    }

    /// Append a `plot_data` row, unless nothing moved since the last one.
    pub fn maybe_update_plot(
        &mut self,
        plot_file: &mut File,
        queue: &Queue,
        bitmap_cvg: f64,
        eps: f64,
    ) -> Result<(), Error> {
        let row = PlotRow {
            cycles: self.queue_cycle,
            cur_path: self.current_entry,
            paths_total: queue.len(),
            pending: queue.pending_not_fuzzed,
            pending_favs: queue.pending_favored,
            crashes: self.unique_crashes,
            hangs: self.unique_hangs,
            max_depth: queue.max_depth,
        };
        if self.plot_prev == Some(row) {
            return Ok(());
        }
        self.plot_prev = Some(row);

        writeln!(
            plot_file,
            "{}, {}, {}, {}, {}, {}, {:.2}%, {}, {}, {}, {:.2}",
            current_millis() / 1000,
            self.queue_cycle.saturating_sub(1),
            row.cur_path,
            row.paths_total,
            row.pending,
            row.pending_favs,
            bitmap_cvg,
            row.crashes,
            row.hangs,
            row.max_depth,
            eps,
        )?;
        plot_file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DumbMode;
    use std::{path::PathBuf, time::Duration};

    fn test_config() -> Config {
        Config {
            out_dir: PathBuf::from("/tmp/x"),
            sync_dir: None,
            sync_id: None,
            force_deterministic: false,
            skip_deterministic: false,
            out_file: None,
            exec_tmout: Duration::from_millis(1000),
            timeout_is_hard: false,
            mem_limit_mb: 50,
            qemu_mode: false,
            qemu_log: false,
            dumb_mode: DumbMode::Off,
            no_forkserver: false,
            no_var_check: false,
            skip_bin_check: true,
            crash_mode: false,
            banner: "banner".into(),
            in_bitmap: None,
            trim_cases: false,
            peer_prefix: String::new(),
            novel_peers: Vec::new(),
            sync_crashes: false,
            target_path: PathBuf::from("/bin/true"),
            target_args: Vec::new(),
            orig_cmdline: "coopfuzz -o /tmp/x /bin/true".into(),
        }
    }

    #[test]
    fn stats_file_lists_the_contract_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzzer_stats");

        let mut stats = Stats::new();
        stats.queue_cycle = 3;
        let queue = Queue::new();
        let cfg = test_config();

        stats
            .write_stats_file(&path, &cfg, &queue, 1234, 1.5, 42.0)
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        for key in [
            "start_time",
            "last_update",
            "fuzzer_pid",
            "first_crash_time",
            "last_crash_time",
            "cycles_done",
            "execs_done",
            "execs_per_sec",
            "paths_total",
            "paths_found",
            "paths_imported",
            "max_depth",
            "cur_path",
            "pending_favs",
            "pending_total",
            "variable_paths",
            "bitmap_cvg",
            "unique_crashes",
            "unique_hangs",
            "sync_times",
            "afl_banner",
            "afl_version",
            "command_line",
        ] {
            assert!(contents.contains(key), "missing field {key}");
        }
        assert!(contents.contains("cycles_done           : 2"));
        assert!(contents.contains("execs_done            : 1234"));
    }

    #[test]
    fn first_crash_time_is_set_once() {
        let mut stats = Stats::new();
        stats.note_crash();
        let first = stats.first_crash_time_ms;
        assert!(first > 0);
        stats.note_crash();
        assert_eq!(stats.first_crash_time_ms, first);
        assert_eq!(stats.unique_crashes, 2);
    }

    #[test]
    fn plot_rows_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot_data");
        let mut plot = File::create(&path).unwrap();

        let mut stats = Stats::new();
        let queue = Queue::new();
        stats.maybe_update_plot(&mut plot, &queue, 0.0, 0.0).unwrap();
        stats.maybe_update_plot(&mut plot, &queue, 0.0, 0.0).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
