//! Harvesting sibling fuzzers' finds from the shared sync root.
//!
//! Each peer publishes `id:NNNNNNNN...` files under its own `queue/` (and
//! `crashes/`) subdirectory. We remember, per peer and subdirectory, the
//! smallest id not yet consumed, replay everything at or above it in sorted
//! order, and advance the cursor past what we took.

use std::{
    fs::{self, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use libafl_bolts::Error;

use crate::config::CASE_PREFIX;

/// One not-yet-consumed entry in a peer subdirectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// The numeric id parsed from the `id:NNNNNNNN` prefix.
    pub id: u32,
    pub path: PathBuf,
}

/// What a scan of one peer subdirectory produced.
#[derive(Debug, Default)]
pub struct PeerScan {
    /// Entries at or above the cursor, sorted by file name.
    pub fresh: Vec<PeerEntry>,
    /// Entries below the cursor, candidates for novel-peer cleanup.
    pub stale: Vec<PathBuf>,
}

/// Read a peer cursor; a missing or short file means "from the beginning".
pub fn read_cursor(path: &Path) -> u32 {
    let mut buf = [0u8; 4];
    match fs::File::open(path) {
        Ok(mut file) => match file.read_exact(&mut buf) {
            Ok(()) => u32::from_le_bytes(buf),
            Err(_) => 0,
        },
        Err(_) => 0,
    }
}

/// Persist a peer cursor for the next cycle.
pub fn write_cursor(path: &Path, min_accept: u32) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&min_accept.to_le_bytes())?;
    Ok(())
}

/// Sibling directories in the sync root we should look at: name starts with
/// `peer_prefix`, is not hidden, and is not us. Sorted for a stable order.
pub fn enumerate_peers(
    sync_dir: &Path,
    own_id: &str,
    peer_prefix: &str,
) -> Result<Vec<String>, Error> {
    let mut peers = Vec::new();
    for entry in sync_dir.read_dir()? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == own_id || !name.starts_with(peer_prefix) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            peers.push(name);
        }
    }
    peers.sort();
    Ok(peers)
}

/// Enumerate one peer subdirectory against a cursor.
///
/// Unparseable names are skipped; an absent directory scans as empty.
pub fn scan_peer_dir(dir: &Path, min_accept: u32) -> Result<PeerScan, Error> {
    let mut scan = PeerScan::default();

    let read_dir = match dir.read_dir() {
        Ok(rd) => rd,
        Err(_) => return Ok(scan),
    };

    let mut names: Vec<_> = read_dir.filter_map(Result::ok).collect();
    names.sort_by_key(|e| e.path());

    for entry in names {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(id) = parse_case_id(&name) else {
            continue;
        };
        if id < min_accept {
            scan.stale.push(entry.path());
        } else {
            scan.fresh.push(PeerEntry {
                id,
                path: entry.path(),
            });
        }
    }
    Ok(scan)
}

/// Take at most `cap` fresh entries and compute the cursor value that skips
/// them next cycle. Entries beyond the cap stay for the next pass.
pub fn select_batch(fresh: &[PeerEntry], cap: usize, min_accept: u32) -> (&[PeerEntry], u32) {
    let take = fresh.len().min(cap);
    let batch = &fresh[..take];
    let next = batch
        .last()
        .map(|e| e.id + 1)
        .unwrap_or(min_accept)
        .max(min_accept);
    (batch, next)
}

/// The id is the leading run of digits after the prefix, at most 8 of them;
/// whatever the producer appended after the id (score, level, operation
/// tags) is ignored.
fn parse_case_id(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(CASE_PREFIX)?;
    let run = digits
        .bytes()
        .take(8)
        .take_while(u8::is_ascii_digit)
        .count();
    if run == 0 {
        return None;
    }
    digits[..run].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer-01_queue");

        assert_eq!(read_cursor(&path), 0);
        write_cursor(&path, 3).unwrap();
        assert_eq!(read_cursor(&path), 3);
        write_cursor(&path, 17).unwrap();
        assert_eq!(read_cursor(&path), 17);
    }

    #[test]
    fn case_ids() {
        assert_eq!(parse_case_id("id:00000004"), Some(4));
        assert_eq!(parse_case_id("id:00000123,sync:peer,src:000002"), Some(123));
        assert_eq!(parse_case_id("id:000000_1.00000_2"), Some(0));
        assert_eq!(parse_case_id("id:000017_0.33333_9,sig:11"), Some(17));
        assert_eq!(parse_case_id("id:0007"), Some(7));
        assert_eq!(parse_case_id("id:_1.00000_2"), None);
        assert_eq!(parse_case_id("README.txt"), None);
    }

    #[test]
    fn parses_the_names_we_write_ourselves() {
        use crate::{
            config::{Config, DumbMode},
            persist::OutputDirs,
        };
        use std::time::Duration;

        let root = tempfile::tempdir().unwrap();
        let cfg = Config {
            out_dir: root.path().join("out"),
            sync_dir: Some(root.path().to_path_buf()),
            sync_id: Some("main".to_string()),
            force_deterministic: false,
            skip_deterministic: true,
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
            banner: "test".to_string(),
            in_bitmap: None,
            trim_cases: false,
            peer_prefix: String::new(),
            novel_peers: Vec::new(),
            sync_crashes: false,
            target_path: PathBuf::from("/bin/true"),
            target_args: Vec::new(),
            orig_cmdline: String::new(),
        };
        let output = OutputDirs::setup(&cfg).unwrap();

        let queued = output.queue_entry_path(7, 1.25, 2);
        let name = queued.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(parse_case_id(&name), Some(7));

        let crashed = output.crash_entry_path(3, 0.5, 9, 11);
        let name = crashed.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(parse_case_id(&name), Some(3));
    }

    #[test]
    fn scan_splits_on_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            fs::write(dir.path().join(format!("id:{i:08}")), b"x").unwrap();
        }
        fs::write(dir.path().join(".lurker"), b"x").unwrap();

        let scan = scan_peer_dir(dir.path(), 2).unwrap();
        assert_eq!(scan.stale.len(), 2);
        assert_eq!(
            scan.fresh.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn consume_then_pick_up_the_new_arrival() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = dir.path().join("cursor");
        for i in 0..3 {
            fs::write(dir.path().join(format!("id:{i:08}")), b"x").unwrap();
        }

        // First pass consumes all three and parks the cursor at 3.
        let scan = scan_peer_dir(dir.path(), read_cursor(&cursor)).unwrap();
        let (batch, next) = select_batch(&scan.fresh, 20, 0);
        assert_eq!(batch.len(), 3);
        write_cursor(&cursor, next).unwrap();
        assert_eq!(read_cursor(&cursor), 3);

        // A new arrival; the second pass takes only that one.
        fs::write(dir.path().join("id:00000003"), b"x").unwrap();
        let scan = scan_peer_dir(dir.path(), read_cursor(&cursor)).unwrap();
        let (batch, next) = select_batch(&scan.fresh, 20, 3);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 3);
        assert_eq!(next, 4);
    }

    #[test]
    fn batch_cap_leaves_the_rest_for_later() {
        let fresh: Vec<_> = (0..30)
            .map(|i| PeerEntry {
                id: i,
                path: PathBuf::from(format!("id:{i:08}")),
            })
            .collect();

        let (batch, next) = select_batch(&fresh, 20, 0);
        assert_eq!(batch.len(), 20);
        assert_eq!(next, 20);
    }

    #[test]
    fn peer_enumeration_filters_and_sorts() {
        let root = tempfile::tempdir().unwrap();
        for name in ["peer-02", "peer-01", "other", ".hidden", "me"] {
            fs::create_dir(root.path().join(name)).unwrap();
        }

        let peers = enumerate_peers(root.path(), "me", "peer-").unwrap();
        assert_eq!(peers, vec!["peer-01", "peer-02"]);

        let all = enumerate_peers(root.path(), "me", "").unwrap();
        assert_eq!(all, vec!["other", "peer-01", "peer-02"]);
    }
}
