//! On-disk spool for batches that could not be delivered.
//!
//! Each batch becomes one `<unix-ms>-<seq>.trn` file: a single JSON
//! header line, then the raw (possibly compressed) body bytes. Files are
//! deleted once their batch is acknowledged. The directory's total size
//! is capped; when a new batch would exceed the cap the oldest files are
//! evicted first.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diag_warn;
use crate::internal_logs::OnceSet;

/// Spool failures. `BatchTooLarge` means the batch alone exceeds the
/// size cap and can never be stored.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpoolError {
    #[error("spool i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("batch of {size} bytes exceeds the spool cap of {cap} bytes")]
    BatchTooLarge { size: u64, cap: u64 },
    #[error("spool file {0} is malformed")]
    Malformed(PathBuf),
}

/// Metadata stored ahead of the body in every spool file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpoolHeader {
    /// Body length in bytes; a consistency check on read-back.
    pub length: u64,
    /// `Content-Encoding` the body was stored with, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    /// Delivery attempts made before the batch was spooled, plus replay
    /// attempts since.
    pub retry_count: u32,
}

/// A batch read back for replay.
#[derive(Debug)]
pub struct SpooledBatch {
    pub path: PathBuf,
    pub header: SpoolHeader,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct Spool {
    dir: PathBuf,
    max_total_bytes: u64,
    seq: AtomicU64,
    /// Writers serialize on this; replay reads use their own handles.
    write_lock: Mutex<()>,
    malformed_logged: OnceSet,
}

impl Spool {
    /// Opens (and creates if needed) the spool directory. Files left by a
    /// previous run stay in place and are picked up by the drainer.
    pub fn open(dir: impl Into<PathBuf>, max_total_bytes: u64) -> Result<Self, SpoolError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Spool {
            dir,
            max_total_bytes,
            seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            malformed_logged: OnceSet::new(),
        })
    }

    /// Persists one batch, evicting the oldest files if the cap would be
    /// exceeded.
    pub fn store(
        &self,
        body: &[u8],
        content_encoding: Option<&str>,
        retry_count: u32,
    ) -> Result<PathBuf, SpoolError> {
        let header = SpoolHeader {
            length: body.len() as u64,
            content_encoding: content_encoding.map(str::to_string),
            retry_count,
        };
        let mut contents = serde_json::to_vec(&header).map_err(io_other)?;
        contents.push(b'\n');
        contents.extend_from_slice(body);

        let size = contents.len() as u64;
        if size > self.max_total_bytes {
            return Err(SpoolError::BatchTooLarge {
                size,
                cap: self.max_total_bytes,
            });
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.evict_for(size)?;
        let name = format!(
            "{}-{}.trn",
            unix_millis(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        );
        let path = self.dir.join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Reads the oldest spooled batch, deleting malformed files along the
    /// way. `None` when the spool is empty.
    pub fn oldest(&self) -> Result<Option<SpooledBatch>, SpoolError> {
        for (path, _) in self.sorted_entries()? {
            match self.read_batch(&path) {
                Ok(batch) => return Ok(Some(batch)),
                Err(_) => {
                    if self.malformed_logged.first(path.display().to_string()) {
                        diag_warn!(
                            name: "spool_file_malformed",
                            path = path.display().to_string()
                        );
                    }
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(None)
    }

    /// Deletes a replayed batch after acknowledgement.
    pub fn remove(&self, path: &Path) -> Result<(), SpoolError> {
        fs::remove_file(path)?;
        Ok(())
    }

    /// Rewrites a batch in place with its retry count bumped, preserving
    /// its position in the replay order.
    pub fn bump_retry(&self, batch: &SpooledBatch) -> Result<(), SpoolError> {
        let header = SpoolHeader {
            retry_count: batch.header.retry_count + 1,
            ..batch.header.clone()
        };
        let mut contents = serde_json::to_vec(&header).map_err(io_other)?;
        contents.push(b'\n');
        contents.extend_from_slice(&batch.body);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::write(&batch.path, contents)?;
        Ok(())
    }

    /// Total bytes currently on disk.
    pub fn total_bytes(&self) -> Result<u64, SpoolError> {
        Ok(self.sorted_entries()?.iter().map(|(_, size)| size).sum())
    }

    fn read_batch(&self, path: &Path) -> Result<SpooledBatch, SpoolError> {
        let contents = fs::read(path)?;
        let split = contents
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| SpoolError::Malformed(path.to_path_buf()))?;
        let header: SpoolHeader = serde_json::from_slice(&contents[..split])
            .map_err(|_| SpoolError::Malformed(path.to_path_buf()))?;
        let body = contents[split + 1..].to_vec();
        if header.length != body.len() as u64 {
            return Err(SpoolError::Malformed(path.to_path_buf()));
        }
        Ok(SpooledBatch {
            path: path.to_path_buf(),
            header,
            body,
        })
    }

    /// Spool files sorted oldest first by their timestamped name.
    fn sorted_entries(&self) -> Result<Vec<(PathBuf, u64)>, SpoolError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if sort_key(&path).is_none() {
                continue;
            }
            let size = entry.metadata()?.len();
            entries.push((path, size));
        }
        entries.sort_by_key(|(path, _)| sort_key(path));
        Ok(entries)
    }

    fn evict_for(&self, incoming: u64) -> Result<(), SpoolError> {
        let entries = self.sorted_entries()?;
        let mut total: u64 = entries.iter().map(|(_, size)| size).sum();
        for (path, size) in entries {
            if total + incoming <= self.max_total_bytes {
                break;
            }
            fs::remove_file(&path)?;
            diag_warn!(name: "spool_evicted_batch", path = path.display().to_string());
            total -= size;
        }
        Ok(())
    }
}

fn sort_key(path: &Path) -> Option<(u64, u64)> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".trn")?;
    let (millis, seq) = stem.split_once('-')?;
    Some((millis.parse().ok()?, seq.parse().ok()?))
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn io_other(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}
