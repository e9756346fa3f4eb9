use crate::types::GlacierResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One line of the failure log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub timestamp: DateTime<Utc>,
    pub unit: String,
    /// `failed` or `partially_delivered`
    pub terminal_state: String,
    pub stage: String,
    pub reason: String,
}

/// Append-only, tab-separated log shared by all workers of a run
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &FailureEntry) -> GlacierResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        writer.serialize(entry)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_entries(&self) -> GlacierResult<Vec<FailureEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(&self.path)?;
        let mut entries = Vec::new();
        for row in reader.deserialize() {
            entries.push(row?);
        }
        Ok(entries)
    }
}
