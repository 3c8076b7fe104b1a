//! Stream Journal
//!
//! Append-only on-disk log backing a durable stream (the dead-letter
//! stream). Entries are framed with a CRC32 checksum so a crash mid-write
//! never corrupts more than the file tail.
//!
//! ## File Format
//!
//! ```text
//! [Frame 1][Frame 2]...[Frame N]
//!
//! Frame:
//! ┌─────────────┬──────────┬──────────────────┐
//! │ Body Size   │ CRC32    │ Body (JSON entry)│
//! │ (4 bytes)   │(4 bytes) │ (N bytes)        │
//! └─────────────┴──────────┴──────────────────┘
//! ```
//!
//! ## Recovery
//!
//! `open` replays every valid frame and returns the recovered entries. A
//! frame with a CRC mismatch is skipped with a warning; a partial frame at
//! the end of the file is treated as an interrupted append and the file is
//! truncated back to the last whole frame.

use crate::entry::StreamEntry;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open or create the journal, replaying existing frames.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<StreamEntry>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (entries, valid_len) = Self::replay(&path).await?;

        // Drop any partial frame left by an interrupted append.
        let file_len = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid = valid_len,
                total = file_len,
                "truncating partial frame at journal tail"
            );
            let f = OpenOptions::new().write(true).open(&path).await?;
            f.set_len(valid_len).await?;
            f.sync_all().await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(
            path = %path.display(),
            recovered = entries.len(),
            "journal opened"
        );

        Ok((Self { path, file }, entries))
    }

    /// Append one entry and fsync. Dead-letter traffic is rare enough that
    /// per-record durability wins over write batching here.
    pub async fn append(&mut self, entry: &StreamEntry) -> Result<()> {
        let body = serde_json::to_vec(entry)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(&body);

        self.file.write_all(&frame).await?;
        self.file.sync_all().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all valid frames; returns the entries and the byte length of the
    /// valid prefix.
    async fn replay(path: &Path) -> Result<(Vec<StreamEntry>, u64)> {
        let mut entries = Vec::new();

        let mut file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((entries, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let mut pos: usize = 0;
        let mut valid_len: u64 = 0;
        while pos + 8 <= buf.len() {
            let body_len =
                u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
            let stored_crc =
                u32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);

            let body_start = pos + 8;
            let body_end = body_start + body_len;
            if body_end > buf.len() {
                // Partial frame at the tail.
                break;
            }

            let body = &buf[body_start..body_end];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(body);
            if hasher.finalize() != stored_crc {
                warn!(
                    path = %path.display(),
                    offset = pos,
                    "corrupt journal frame (CRC mismatch), skipping"
                );
                pos = body_end;
                valid_len = pos as u64;
                continue;
            }

            match serde_json::from_slice::<StreamEntry>(body) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset = pos,
                        error = %e,
                        "undecodable journal frame, skipping"
                    );
                }
            }
            pos = body_end;
            valid_len = pos as u64;
        }

        Ok((entries, valid_len))
    }
}
