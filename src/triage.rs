//! Breadcrumbs for later triage.
//!
//! Every persisted crash or hang gets one compact CBOR record naming where
//! the input came from, how it was ranked, and what it did, filed under a
//! subdirectory per origin. External tooling can replay the referenced
//! inputs without re-deriving any of this.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::BufWriter,
    path::{Path, PathBuf},
};

use libafl_bolts::Error;
use serde::{Deserialize, Serialize};

use crate::executor::ExecOutcome;

/// One persisted finding.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TriageRecord {
    /// Outcome tag: `Cr` for crashes, `Tm` for hangs.
    pub outcome: String,
    /// Terminating signal, when one applies.
    pub signal: i32,
    /// Sibling fuzzer the input came from, or `local`.
    pub origin: String,
    /// Where the input bytes were persisted.
    pub saved_as: String,
    /// Seed score at the time of the find.
    pub score: f64,
    /// Seed level at the time of the find.
    pub level: u8,
    /// Execution checksum of the classified trace.
    pub cksum: u32,
}

impl TriageRecord {
    pub fn new(
        outcome: ExecOutcome,
        origin: &str,
        saved_as: &Path,
        score: f64,
        level: u8,
        cksum: u32,
    ) -> Self {
        let (tag, signal) = match outcome {
            ExecOutcome::Crash { signal } => ("Cr", signal),
            ExecOutcome::Hang => ("Tm", 0),
            _ => ("Ok", 0),
        };
        Self {
            outcome: tag.to_string(),
            signal,
            origin: origin.to_string(),
            saved_as: saved_as.to_string_lossy().into_owned(),
            score,
            level,
            cksum,
        }
    }
}

/// Writes numbered CBOR records, one file per finding, grouped into a
/// subdirectory per origin so one peer's findings can be triaged together.
#[derive(Debug)]
pub struct TriageCollector {
    records_dir: PathBuf,
    /// Next record number per origin subdirectory.
    per_origin: HashMap<String, usize>,
}

impl TriageCollector {
    /// Creates the collector, making sure the root directory exists.
    pub fn new(path: &Path) -> Result<Self, Error> {
        match path.exists() {
            true if path.is_dir() => {}
            true => {
                return Err(Error::illegal_argument(
                    "Path to the triage dir is a file that already exists.",
                ))
            }
            false => std::fs::create_dir_all(path)?,
        }

        Ok(Self {
            records_dir: path.to_path_buf(),
            per_origin: HashMap::new(),
        })
    }

    /// Serialize one record to its own numbered file under the record's
    /// origin subdirectory.
    pub fn append(&mut self, record: &TriageRecord) -> Result<(), Error> {
        let origin_dir = self.records_dir.join(&record.origin);
        std::fs::create_dir_all(&origin_dir)?;

        let record_no = self.per_origin.entry(record.origin.clone()).or_insert(0);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(origin_dir.join(Self::filename(*record_no)))?;
        let mut writer = BufWriter::new(file);

        ciborium::into_writer(record, &mut writer)
            .map_err(|e| Error::serialize(format!("Could not write triage record: {e}")))?;
        *record_no += 1;
        Ok(())
    }

    fn filename(record_no: usize) -> String {
        format!("record_{record_no}.cbor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_roundtrip_through_cbor() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = TriageCollector::new(&dir.path().join("triage")).unwrap();

        let record = TriageRecord::new(
            ExecOutcome::Crash { signal: 11 },
            "peer-02",
            Path::new("/tmp/out-crashes/queue/id:000000_1.00000_2,sig:11"),
            1.0,
            2,
            0xdeadbeef,
        );
        collector.append(&record).unwrap();

        let file =
            File::open(dir.path().join("triage").join("peer-02").join("record_0.cbor")).unwrap();
        let back: TriageRecord = ciborium::from_reader(file).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn records_are_grouped_and_numbered_per_origin() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("triage");
        let mut collector = TriageCollector::new(&root).unwrap();

        let record = |origin: &str| {
            TriageRecord::new(
                ExecOutcome::Hang,
                origin,
                Path::new("/tmp/out/hangs/id:000000,sync:peer,src:00000001"),
                0.5,
                9,
                0x1234,
            )
        };
        collector.append(&record("peer-01")).unwrap();
        collector.append(&record("peer-01")).unwrap();
        collector.append(&record("local")).unwrap();

        assert!(root.join("peer-01").join("record_0.cbor").is_file());
        assert!(root.join("peer-01").join("record_1.cbor").is_file());
        assert!(root.join("local").join("record_0.cbor").is_file());
        assert!(!root.join("peer-01").join("record_2.cbor").exists());
    }
}
