use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::transfer::TransferOutcome;

/// Append-only JSONL journal of finished transfers, one outcome per line.
/// The file stays open for the life of the journal; each outcome goes out
/// in a single write so lines from concurrent transfers never interleave.
pub struct TransferLog {
    path: PathBuf,
    sink: Mutex<File>,
}

impl TransferLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open transfer log {}", path.display()))?;
        Ok(Self {
            path,
            sink: Mutex::new(sink),
        })
    }

    pub fn record(&self, outcome: &TransferOutcome) -> Result<()> {
        let mut line = serde_json::to_vec(outcome)?;
        line.push(b'\n');
        self.sink
            .lock()
            .write_all(&line)
            .with_context(|| format!("append to {}", self.path.display()))
    }

    /// Every outcome journaled at `path` so far. A missing file is an empty journal.
    pub fn load(path: &Path) -> Result<Vec<TransferOutcome>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{}:{}: bad journal entry", path.display(), i + 1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{Direction, Tally};
    use uuid::Uuid;

    #[test]
    fn appends_and_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("journal/transfers.jsonl");
        assert!(TransferLog::load(&path).unwrap().is_empty());

        let log = TransferLog::open(&path).unwrap();
        let done = TransferOutcome::new(
            Uuid::new_v4(),
            Direction::Sent,
            "a.txt",
            Some("127.0.0.1:4000".parse().unwrap()),
            Tally {
                transferred: 12,
                expected: 12,
                error: None,
            },
            None,
        );
        let failed = TransferOutcome::aborted(Uuid::new_v4(), Direction::Received, "b.txt", "cancelled");
        log.record(&done).unwrap();
        log.record(&failed).unwrap();

        let entries = TransferLog::load(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, done.id);
        assert!(entries[0].is_complete());
        assert_eq!(entries[1].file, "b.txt");
        assert_eq!(entries[1].error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn load_names_the_bad_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.jsonl");
        fs::write(&path, "\n{not json}\n").unwrap();
        let err = TransferLog::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("transfers.jsonl:2"));
    }
}
