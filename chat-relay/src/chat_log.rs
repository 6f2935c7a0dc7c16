//! Append-only chat history on disk.
//!
//! Each call opens the file, writes, and lets the handle drop, so no file
//! descriptor outlives the operation. The relay's single event loop is the
//! only writer, which keeps appends ordered without a lock.

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

const TIMESTAMP_FORMAT: &str = "[%Y-%m-%d %H:%M:%S]";

#[derive(Debug, Clone)]
pub struct ChatLog {
    path: PathBuf,
}

impl ChatLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `message` stamped with the current local time.
    pub async fn append(&self, message: &str) -> io::Result<()> {
        let entry = format_entry(&Local::now(), message);
        self.append_raw(entry.as_bytes()).await
    }

    /// Appends bytes verbatim. The client uses this to keep fetched logs.
    pub async fn append_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }

    pub async fn read_all(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path).await
    }
}

pub fn format_entry(at: &DateTime<Local>, message: &str) -> String {
    format!("{} {message}\n", at.format(TIMESTAMP_FORMAT))
}
