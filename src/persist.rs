//! The on-disk session: output directory layout, the instance lock, and the
//! marker files external tooling reads.
//!
//! Layout under `<out>/`:
//!
//! ```text
//! queue/id:NNNNNN_<score>_<level>       surviving inputs
//! queue/.state/...                      markers for external tooling
//! hangs/                                timing-out inputs
//! <out>-crashes/queue/                  crashing inputs
//! .synced/                              per-peer import cursors
//! .cur_input                            rewritten before every execution
//! .cur_code_block_info                  auxiliary channel for the target
//! fuzz_bitmap, fuzzer_stats, plot_data  session state and telemetry
//! ```

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::{fs::symlink, io::{AsRawFd, RawFd}},
    path::{Path, PathBuf},
};

use libafl_bolts::Error;
use nix::fcntl::{flock, FlockArg};

use crate::{
    config::{Config, OUTPUT_GRACE_MINS},
    queue::Queue,
};

/// Every path the campaign writes to, plus the held instance lock.
pub struct OutputDirs {
    out_dir: PathBuf,
    queue_dir: PathBuf,
    hangs_dir: PathBuf,
    crashes_dir: PathBuf,
    synced_dir: Option<PathBuf>,
    /// Plot output, opened once, appended to for the whole run.
    pub plot_file: File,
    /// The auxiliary code-block-info channel, held open for the children.
    cb_info: File,
    /// Advisory lock on the output directory; released when dropped.
    _lock: File,
}

impl OutputDirs {
    /// Create or reuse the output tree, guarding against a second instance
    /// and against clobbering a long-running session's results.
    pub fn setup(cfg: &Config) -> Result<Self, Error> {
        let out_dir = &cfg.out_dir;
        let existed = out_dir.exists();
        if !existed {
            fs::create_dir_all(out_dir)?;
        }

        let lock = lock_out_dir(out_dir)?;
        if existed {
            refuse_at_risk_data(out_dir)?;
            log::info!("Output directory exists but deemed OK to reuse.");
        }

        let queue_dir = out_dir.join("queue");
        let state_dir = queue_dir.join(".state");
        let hangs_dir = out_dir.join("hangs");
        let crashes_dir = crash_store_root(out_dir).join("queue");

        for dir in [
            &queue_dir,
            &state_dir,
            &state_dir.join("deterministic_done"),
            &state_dir.join("auto_extras"),
            &state_dir.join("redundant_edges"),
            &state_dir.join("favored_edges"),
            &state_dir.join("variable_behavior"),
            &hangs_dir,
            &crashes_dir,
        ] {
            ensure_dir(dir)?;
        }

        let synced_dir = if cfg.sync_id.is_some() {
            let dir = out_dir.join(".synced");
            ensure_dir(&dir)?;
            Some(dir)
        } else {
            None
        };

        let plot_path = out_dir.join("plot_data");
        let write_header = !plot_path.exists();
        let mut plot_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&plot_path)?;
        if write_header {
            writeln!(
                plot_file,
                "# unix_time, cycles_done, cur_path, paths_total, pending_total, \
                 pending_favs, map_size, unique_crashes, unique_hangs, max_depth, \
                 execs_per_sec"
            )?;
        }

        let cb_info_path = out_dir.join(".cur_code_block_info");
        let _ = fs::remove_file(&cb_info_path);
        let cb_info = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&cb_info_path)?;

        Ok(Self {
            out_dir: out_dir.clone(),
            queue_dir,
            hangs_dir,
            crashes_dir,
            synced_dir,
            plot_file,
            cb_info,
            _lock: lock,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// The file rewritten before every execution.
    pub fn cur_input_path(&self) -> PathBuf {
        self.out_dir.join(".cur_input")
    }

    pub fn cb_info_fd(&self) -> RawFd {
        self.cb_info.as_raw_fd()
    }

    pub fn qemu_log_path(&self) -> PathBuf {
        self.out_dir.join("qemu_log")
    }

    pub fn fuzz_bitmap_path(&self) -> PathBuf {
        self.out_dir.join("fuzz_bitmap")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.out_dir.join("fuzzer_stats")
    }

    /// Name of a new queue entry carrying its score and level.
    pub fn queue_entry_path(&self, id: u32, score: f64, level: u8) -> PathBuf {
        self.queue_dir
            .join(format!("id:{id:06}_{score:.5}_{level}"))
    }

    /// Name of a new crash entry; the signal suffix keeps triage greppable.
    pub fn crash_entry_path(&self, id: u64, score: f64, level: u8, signal: i32) -> PathBuf {
        self.crashes_dir
            .join(format!("id:{id:06}_{score:.5}_{level},sig:{signal:02}"))
    }

    /// Name of a new hang entry, recording the operation that found it.
    pub fn hang_entry_path(&self, id: u64, op: &str) -> PathBuf {
        self.hangs_dir.join(format!("id:{id:06},{op}"))
    }

    /// Cursor file for one peer subdirectory.
    pub fn sync_cursor_path(&self, peer: &str, subdir: &str) -> Result<PathBuf, Error> {
        let synced = self.synced_dir.as_ref().ok_or_else(|| {
            Error::illegal_state("Sync cursor requested without a sync id")
        })?;
        Ok(synced.join(format!("{peer}_{subdir}")))
    }

    /// Bring the `favored_edges/` and `redundant_edges/` marker directories
    /// in line with the latest cull.
    pub fn update_cull_markers(&self, queue: &mut Queue) -> Result<(), Error> {
        let favored_dir = self.queue_dir.join(".state").join("favored_edges");
        let redundant_dir = self.queue_dir.join(".state").join("redundant_edges");

        for (_, entry) in queue.iter_mut() {
            let Some(name) = entry.fname.file_name() else {
                continue;
            };

            let favored_mark = favored_dir.join(name);
            if entry.favored && !favored_mark.exists() {
                File::create(&favored_mark)?;
            } else if !entry.favored && favored_mark.exists() {
                fs::remove_file(&favored_mark)?;
            }

            let redundant = !entry.favored;
            if redundant != entry.fs_redundant {
                let mark = redundant_dir.join(name);
                if redundant {
                    File::create(&mark)?;
                } else {
                    let _ = fs::remove_file(&mark);
                }
                entry.fs_redundant = redundant;
            }
        }
        Ok(())
    }

    /// Symlink a flaky entry into `variable_behavior/`.
    pub fn mark_variable_on_disk(&self, fname: &Path) -> Result<(), Error> {
        if let Some(name) = fname.file_name() {
            let link = self
                .queue_dir
                .join(".state")
                .join("variable_behavior")
                .join(name);
            if !link.exists() {
                symlink(Path::new("../..").join(name), link)?;
            }
        }
        Ok(())
    }

    /// One-time README next to the crash store.
    pub fn write_crash_readme(&self, cfg: &Config) {
        let path = crash_store_root(&self.out_dir).join("README.txt");
        if path.exists() {
            return;
        }
        // Not worth dying over.
        let _ = fs::write(
            &path,
            format!(
                "Command line used to find these crashes:\n\n{}\n\n\
                 If a crash does not reproduce outside the fuzzer, make sure to apply the\n\
                 same memory limit; this session used -m {}.\n",
                cfg.orig_cmdline, cfg.mem_limit_mb
            ),
        );
    }
}

/// `<out>-crashes`, the sibling tree crashing inputs are published under.
pub fn crash_store_root(out_dir: &Path) -> PathBuf {
    let mut name = out_dir.as_os_str().to_owned();
    name.push("-crashes");
    PathBuf::from(name)
}

/// Persist an input's bytes at the path a queue entry will reference.
pub fn write_testcase(path: &Path, data: &[u8]) -> Result<(), Error> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(data)?;
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<(), Error> {
    fs::create_dir_all(path)?;
    Ok(())
}

fn lock_out_dir(out_dir: &Path) -> Result<File, Error> {
    let lock = File::open(out_dir)?;
    if flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
        log::error!(
            "The job output directory is being used by another instance; choose a \
             different location or stop the other process first."
        );
        return Err(Error::illegal_state(format!(
            "Directory '{}' is in use",
            out_dir.display()
        )));
    }
    Ok(lock)
}

/// Refuse to reuse a directory holding substantial results from an earlier
/// session.
fn refuse_at_risk_data(out_dir: &Path) -> Result<(), Error> {
    let stats_path = out_dir.join("fuzzer_stats");
    let Ok(contents) = fs::read_to_string(&stats_path) else {
        return Ok(());
    };

    let field = |key: &str| {
        contents.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key).then(|| v.trim().parse::<u64>().ok())?
        })
    };

    if let (Some(start), Some(update)) = (field("start_time"), field("last_update")) {
        if update.saturating_sub(start) > OUTPUT_GRACE_MINS * 60 {
            log::error!(
                "The output directory holds more than {OUTPUT_GRACE_MINS} minutes of \
                 results from an earlier session; remove or rename it manually to avoid \
                 data loss."
            );
            return Err(Error::illegal_state(format!(
                "At-risk data found in '{}'",
                out_dir.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn crash_store_is_a_sibling() {
        assert_eq!(
            crash_store_root(Path::new("/tmp/findings")),
            PathBuf::from("/tmp/findings-crashes")
        );
    }

    #[test]
    fn testcase_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id:000000_1.00000_2");
        write_testcase(&path, b"\x00payload\xff").unwrap();

        let mut back = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut back).unwrap();
        assert_eq!(back, b"\x00payload\xff");

        // Existing entries are never overwritten.
        assert!(write_testcase(&path, b"other").is_err());
    }

    #[test]
    fn grace_check_refuses_old_sessions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("fuzzer_stats"),
            "start_time            : 1000\nlast_update           : 9999\n",
        )
        .unwrap();
        assert!(refuse_at_risk_data(dir.path()).is_err());

        fs::write(
            dir.path().join("fuzzer_stats"),
            "start_time            : 1000\nlast_update           : 1060\n",
        )
        .unwrap();
        assert!(refuse_at_risk_data(dir.path()).is_ok());
    }
}
