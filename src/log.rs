use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};
use std::fs::{OpenOptions, File};
use std::io::{BufReader, BufWriter, Write, BufRead};
use anyhow::{Result, Context};
use chrono::Utc;

use crate::model::{FileKey, NodeId};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    PartiallyFailed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub task_id: String,
    pub kind: String,
    pub file: FileKey,
    pub source: Option<NodeId>,
    pub completed: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
    pub status: TransferStatus,
    pub bytes_total: u64,
}

impl TransferLogEntry {
    pub fn stamped(mut self) -> Self {
        self.timestamp = Utc::now().to_rfc3339();
        self
    }
}

/// Append-only JSONL record of finished transfer tasks
pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(state_dir: &Path) -> Self {
        let log_file_path = state_dir.join("transfers.jsonl");
        TransferLog { log_file_path }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        TransferLog { log_file_path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: TransferLogEntry) -> Result<()> {
        if let Some(parent) = self.log_file_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
