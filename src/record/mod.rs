//! Training record log
//!
//! One CSV row per completed search epoch. The log is append-only and
//! defines the resumability contract: on restart the orchestrator reads the
//! last row to find the next epoch and the best accuracy so far.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EnasError, Result};

/// One row of the training record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub epoch: usize,
    pub lr: f64,
    pub reward: f64,
    pub val_loss: f64,
    pub best_val_acc: f64,
}

/// Append-only CSV log at `<working_dir>/<name>_record.csv`
#[derive(Debug, Clone)]
pub struct RecordLog {
    path: PathBuf,
}

impl RecordLog {
    pub fn new(working_dir: &Path, name: &str) -> Self {
        Self {
            path: working_dir.join(format!("{name}_record.csv")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one row, writing the header when the file is created.
    ///
    /// The write is flushed and synced before returning; a committed row
    /// must survive a crash in any later step of the same epoch.
    pub fn append(&self, row: &RecordRow) -> Result<()> {
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| EnasError::Io(io::Error::other(e.to_string())))?;
        file.sync_all()?;
        debug!(epoch = row.epoch, reward = row.reward, "record row committed");
        Ok(())
    }

    /// Read every committed row. `Ok(None)` when no record file exists.
    pub fn rows(&self) -> Result<Option<Vec<RecordRow>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(Some(rows))
    }

    /// The most recent committed row, if a record exists.
    pub fn last_row(&self) -> Result<Option<RecordRow>> {
        Ok(self.rows()?.and_then(|rows| rows.into_iter().last()))
    }
}
