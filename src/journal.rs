use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::runner::FailureKind;

const JOURNAL_STEM: &str = "geocode-journal";

/// One line of the run journal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    RunStarted {
        candidates: usize,
        max_count: usize,
    },
    Failure {
        address_key: String,
        kind: FailureKind,
        reason: String,
    },
    RunFinished {
        attempted: usize,
        succeeded: usize,
        failed: usize,
    },
    RunAborted {
        address_key: String,
        reason: String,
        succeeded: usize,
        failed: usize,
    },
}

#[derive(Serialize)]
struct JournalLine<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a JournalEvent,
}

/// Append-only JSON-lines record of geocoding runs.
///
/// Lines are buffered until `batch_size` accumulate or `flush` is called.
/// When the live file would grow past `max_bytes` it shifts to
/// `geocode-journal.1.jsonl` (older files move up one number) and at most
/// `max_files` files are kept, live file included.
pub struct RunJournal {
    dir: PathBuf,
    pending: Mutex<Vec<String>>,
    batch_size: usize,
    max_bytes: u64,
    max_files: usize,
}

impl RunJournal {
    pub fn open<P: AsRef<Path>>(dir: P, config: &AppConfig) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            pending: Mutex::new(Vec::new()),
            batch_size: config.journal_batch_size.max(1),
            max_bytes: config.journal_max_bytes,
            max_files: config.journal_max_files.max(1),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.numbered(0)
    }

    pub fn record(&self, event: JournalEvent) -> AppResult<()> {
        let line = serde_json::to_string(&JournalLine {
            at: Utc::now(),
            event: &event,
        })?;
        let mut pending = self.pending.lock();
        pending.push(line);
        if pending.len() >= self.batch_size {
            self.write_out(&mut pending)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut pending = self.pending.lock();
        self.write_out(&mut pending)
    }

    // Lines stay pending when the write fails.
    fn write_out(&self, pending: &mut Vec<String>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let incoming: u64 = pending.iter().map(|line| line.len() as u64 + 1).sum();
        self.rotate_for(incoming)?;

        let mut contents = pending.join("\n");
        contents.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())?;
        file.write_all(contents.as_bytes())?;
        debug!(lines = pending.len(), path = %self.path().display(), "run journal written");
        pending.clear();
        Ok(())
    }

    fn rotate_for(&self, incoming: u64) -> AppResult<()> {
        let current = match fs::metadata(self.path()) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Ok(()),
        };
        if current == 0 || current + incoming <= self.max_bytes {
            return Ok(());
        }

        let oldest = self.max_files - 1;
        if oldest == 0 {
            fs::remove_file(self.path())?;
            return Ok(());
        }
        let _ = fs::remove_file(self.numbered(oldest));
        for index in (0..oldest).rev() {
            let from = self.numbered(index);
            if from.exists() {
                fs::rename(&from, self.numbered(index + 1))?;
            }
        }
        Ok(())
    }

    fn numbered(&self, index: usize) -> PathBuf {
        match index {
            0 => self.dir.join(format!("{JOURNAL_STEM}.jsonl")),
            n => self.dir.join(format!("{JOURNAL_STEM}.{n}.jsonl")),
        }
    }
}
