//! Append-only error log
//!
//! One block per cycle that had errors: a timestamp header line followed by
//! one line per message.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a block. Nothing is written for an empty message list.
    pub async fn append(&self, at: DateTime<Local>, messages: &[String]) -> std::io::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut block = format!("[{}]\n", at.format("%Y-%m-%d %H:%M:%S"));
        for message in messages {
            block.push_str(message.trim_end());
            block.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(block.as_bytes()).await?;
        file.flush().await?;

        debug!("wrote {} messages to {}", messages.len(), self.path.display());
        Ok(())
    }
}
