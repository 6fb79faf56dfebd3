//! Chunked upload reassembly.
//!
//! Each announced upload gets a preallocated `<id>.part` file in the transfer
//! directory. Chunks are written at their logical offset in any order; once
//! every chunk has arrived the file is verified against the declared BLAKE3
//! hash and renamed to `<id>-<file name>`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nexus_shared::UploadId;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ServerError;

const MAX_FILE_NAME_LEN: usize = 255;

/// Chunk geometry handed back to the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTicket {
    pub upload_id: UploadId,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    pub upload_id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub is_complete: bool,
    pub started_at: DateTime<Utc>,
}

/// A finished, verified upload.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub upload_id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub path: PathBuf,
}

struct TransferRecord {
    file_name: String,
    file_size: u64,
    file_hash: String,
    sender_id: String,
    receiver_id: Option<String>,
    total_chunks: u32,
    received: Vec<bool>,
    received_count: u32,
    completed: bool,
    temp_path: PathBuf,
    file: Option<fs::File>,
    started_at: DateTime<Utc>,
}

struct TransferEntry {
    created: Instant,
    record: Mutex<TransferRecord>,
}

pub struct FileTransferManager {
    transfers: RwLock<HashMap<UploadId, Arc<TransferEntry>>>,
    next_id: AtomicU64,
    dir: PathBuf,
    chunk_size: usize,
    max_file_size: u64,
}

impl FileTransferManager {
    /// Create the manager, making sure the transfer directory exists.
    pub async fn new(dir: PathBuf, chunk_size: usize, max_file_size: u64) -> Result<Self, ServerError> {
        fs::create_dir_all(&dir).await.map_err(|e| {
            ServerError::Storage(format!(
                "Failed to create transfer directory '{}': {}",
                dir.display(),
                e
            ))
        })?;

        info!(path = %dir.display(), chunk_size, "Transfer store initialized");

        Ok(Self {
            transfers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dir,
            chunk_size: chunk_size.max(1),
            max_file_size,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Announce an upload and allocate its backing file.
    pub async fn start_upload(
        &self,
        file_name: &str,
        file_size: u64,
        file_hash: &str,
        sender_id: &str,
        receiver_id: Option<&str>,
    ) -> Result<UploadTicket, ServerError> {
        if file_size > self.max_file_size {
            return Err(ServerError::FileTooLarge {
                size: file_size,
                max: self.max_file_size,
            });
        }
        if file_size == 0 {
            return Err(ServerError::InvalidFileFormat("empty file".into()));
        }
        let file_name = sanitize_file_name(file_name)?;
        let file_hash = normalize_hash(file_hash)?;

        let chunk = self.chunk_size as u64;
        let total_chunks = u32::try_from(file_size.div_ceil(chunk)).map_err(|_| {
            ServerError::FileTooLarge {
                size: file_size,
                max: self.max_file_size,
            }
        })?;

        let upload_id = UploadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let temp_path = self.dir.join(format!("{}.part", upload_id.0));

        let file = fs::File::create(&temp_path).await.map_err(|e| {
            ServerError::Storage(format!("Failed to create {}: {}", temp_path.display(), e))
        })?;
        file.set_len(file_size).await?;

        let record = TransferRecord {
            file_name,
            file_size,
            file_hash,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.map(str::to_string),
            total_chunks,
            received: vec![false; total_chunks as usize],
            received_count: 0,
            completed: false,
            temp_path,
            file: Some(file),
            started_at: Utc::now(),
        };

        self.transfers.write().await.insert(
            upload_id,
            Arc::new(TransferEntry {
                created: Instant::now(),
                record: Mutex::new(record),
            }),
        );

        info!(upload = %upload_id, size = file_size, total_chunks, sender = sender_id, "Upload started");

        Ok(UploadTicket {
            upload_id,
            chunk_size: self.chunk_size as u32,
            total_chunks,
        })
    }

    async fn entry(&self, upload_id: UploadId) -> Result<Arc<TransferEntry>, ServerError> {
        self.transfers
            .read()
            .await
            .get(&upload_id)
            .cloned()
            .ok_or(ServerError::UnknownTransfer(upload_id))
    }

    /// Store one chunk. Returns `true` only when this chunk is the one that
    /// makes the set complete; repeats of a received index overwrite the
    /// data without counting twice.
    pub async fn process_chunk(
        &self,
        upload_id: UploadId,
        index: u32,
        data: &[u8],
    ) -> Result<bool, ServerError> {
        let entry = self.entry(upload_id).await?;
        let mut record = entry.record.lock().await;

        if record.completed {
            return Ok(false);
        }
        if index >= record.total_chunks {
            return Err(ServerError::InvalidChunk { upload_id, index });
        }

        let offset = index as u64 * self.chunk_size as u64;
        let expected = (self.chunk_size as u64).min(record.file_size - offset);
        if data.len() as u64 != expected {
            return Err(ServerError::InvalidChunk { upload_id, index });
        }

        let file = record
            .file
            .as_mut()
            .ok_or_else(|| ServerError::Storage(format!("{} is already closed", upload_id)))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        let slot = &mut record.received[index as usize];
        if *slot {
            debug!(upload = %upload_id, index, "Duplicate chunk overwritten");
            return Ok(false);
        }
        *slot = true;
        record.received_count += 1;
        Ok(record.received_count == record.total_chunks)
    }

    /// Verify and publish a fully received upload, then drop its record.
    ///
    /// A size or hash mismatch discards the data and the record as well.
    pub async fn complete(&self, upload_id: UploadId) -> Result<CompletedTransfer, ServerError> {
        let entry = self.entry(upload_id).await?;
        let mut record = entry.record.lock().await;

        if record.received_count != record.total_chunks {
            return Err(ServerError::InvalidFileFormat(format!(
                "{} has {}/{} chunks",
                upload_id, record.received_count, record.total_chunks
            )));
        }

        let result = self.finalize(upload_id, &mut record).await;
        if result.is_err() {
            record.file = None;
            remove_quietly(&record.temp_path).await;
        }
        drop(record);
        self.transfers.write().await.remove(&upload_id);

        match &result {
            Ok(done) => info!(upload = %upload_id, path = %done.path.display(), "Upload complete"),
            Err(e) => warn!(upload = %upload_id, error = %e, "Upload rejected"),
        }
        result
    }

    async fn finalize(
        &self,
        upload_id: UploadId,
        record: &mut TransferRecord,
    ) -> Result<CompletedTransfer, ServerError> {
        if let Some(mut file) = record.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let written = fs::metadata(&record.temp_path).await?.len();
        if written != record.file_size {
            return Err(ServerError::InvalidFileFormat(format!(
                "size mismatch: declared {}, stored {}",
                record.file_size, written
            )));
        }

        if !record.file_hash.is_empty() {
            let actual = hash_file(&record.temp_path).await?;
            if actual != record.file_hash {
                return Err(ServerError::InvalidFileFormat("content hash mismatch".into()));
            }
        }

        let path = self.dir.join(format!("{}-{}", upload_id.0, record.file_name));
        fs::rename(&record.temp_path, &path).await?;
        record.completed = true;

        Ok(CompletedTransfer {
            upload_id,
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            sender_id: record.sender_id.clone(),
            receiver_id: record.receiver_id.clone(),
            path,
        })
    }

    /// Discard an upload and its partial data.
    pub async fn cancel(&self, upload_id: UploadId) -> bool {
        let Some(entry) = self.transfers.write().await.remove(&upload_id) else {
            return false;
        };

        let mut record = entry.record.lock().await;
        record.file = None;
        if !record.completed {
            remove_quietly(&record.temp_path).await;
        }
        info!(upload = %upload_id, "Upload cancelled");
        true
    }

    /// Cancel every incomplete upload older than `max_age`.
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let expired: Vec<UploadId> = self
            .transfers
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.created.elapsed() >= max_age)
            .map(|(id, _)| *id)
            .collect();

        let mut removed = 0;
        for upload_id in expired {
            if self.cancel(upload_id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Expired uploads swept");
        }
        removed
    }

    pub async fn get_transfer_info(&self, upload_id: UploadId) -> Option<TransferInfo> {
        let entry = self.entry(upload_id).await.ok()?;
        let record = entry.record.lock().await;
        Some(info_of(upload_id, &record))
    }

    /// Every in-flight upload, ordered by id.
    pub async fn list(&self) -> Vec<TransferInfo> {
        let mut entries: Vec<(UploadId, Arc<TransferEntry>)> = self
            .transfers
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut infos = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            infos.push(info_of(id, &*entry.record.lock().await));
        }
        infos
    }

    pub async fn active_count(&self) -> usize {
        self.transfers.read().await.len()
    }
}

fn info_of(upload_id: UploadId, record: &TransferRecord) -> TransferInfo {
    TransferInfo {
        upload_id,
        file_name: record.file_name.clone(),
        file_size: record.file_size,
        sender_id: record.sender_id.clone(),
        receiver_id: record.receiver_id.clone(),
        total_chunks: record.total_chunks,
        received_chunks: record.received_count,
        is_complete: record.received_count == record.total_chunks,
        started_at: record.started_at,
    }
}

/// Reject names that could escape the transfer directory.
fn sanitize_file_name(name: &str) -> Result<String, ServerError> {
    let name = name.trim();
    if name.is_empty()
        || name.len() > MAX_FILE_NAME_LEN
        || name == "."
        || name == ".."
        || name.contains(|c: char| matches!(c, '/' | '\\' | '\0') || c.is_control())
    {
        return Err(ServerError::InvalidFileFormat(format!("bad file name {:?}", name)));
    }
    Ok(name.to_string())
}

/// Empty means "do not verify"; otherwise a 32-byte hex digest.
fn normalize_hash(hash: &str) -> Result<String, ServerError> {
    let hash = hash.trim();
    if hash.is_empty() {
        return Ok(String::new());
    }
    match hex::decode(hash) {
        Ok(bytes) if bytes.len() == blake3::OUT_LEN => Ok(hash.to_ascii_lowercase()),
        _ => Err(ServerError::InvalidFileFormat("malformed content hash".into())),
    }
}

async fn hash_file(path: &Path) -> Result<String, ServerError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial upload");
        }
    }
}
