//! # Telemetry Module
//!
//! Raw fix log: every line the device returns to a fix request is appended
//! to a per-day text file.
//!
//! This module handles:
//! - Creating the record directory on first write
//! - Naming files by local date (`YYYY-MM-DD.txt`)
//! - Prefixing each line with the local wall-clock time
//!
//! Writes go through `tokio::fs`, so the poll task never blocks a runtime
//! thread on the card. Failures are logged and swallowed.

use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Appends raw fix lines to daily files under a directory
#[derive(Debug, Clone)]
pub struct FixRecorder {
    dir: PathBuf,
}

impl FixRecorder {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Append `line` to today's file
    pub async fn record(&self, line: &str) {
        let now = Local::now();
        let path = self.file_for(&now.format("%Y-%m-%d").to_string());
        let entry = format!("{}: {}\n", now.format("%H:%M:%S"), line);

        if let Err(e) = self.append(&path, &entry).await {
            warn!("Failed to record fix line to {}: {}", path.display(), e);
        }
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", date))
    }

    async fn append(&self, path: &Path, entry: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await
    }
}
