//! Helpers for moving upload/download streams without buffering whole objects.

use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::ObjectStream;
use crate::error::{StorageError, StorageResult};

/// Outcome of copying a stream to a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStats {
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the copied bytes
    pub sha256: String,
}

/// Reject payloads larger than the configured per-file limit.
pub fn ensure_size_within(key: &str, size: u64, max_file_size_bytes: u64) -> StorageResult<()> {
    if size > max_file_size_bytes {
        return Err(StorageError::quota_exceeded(format!(
            "upload of {} bytes for '{}' exceeds the maximum file size of {} bytes",
            size, key, max_file_size_bytes
        ))
        .with_detail("key", key)
        .with_detail("size", size)
        .with_detail("max_file_size_bytes", max_file_size_bytes));
    }
    Ok(())
}

/// Reject a buffered or streamed payload whose length differs from the
/// length the caller declared.
pub fn ensure_declared_length(key: &str, declared: Option<u64>, actual: u64) -> StorageResult<()> {
    match declared {
        Some(declared) if declared != actual => Err(StorageError::backend(format!(
            "declared content length {} for '{}' does not match the {} bytes received",
            declared, key, actual
        ))
        .with_detail("key", key)
        .with_detail("content_length", declared)
        .with_detail("received", actual)),
        _ => Ok(()),
    }
}

/// Copy `stream` into `writer`, failing as soon as more than
/// `max_file_size_bytes` have been seen.
pub async fn copy_limited<W>(
    key: &str,
    mut stream: ObjectStream,
    writer: &mut W,
    max_file_size_bytes: u64,
) -> StorageResult<CopyStats>
where
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            StorageError::backend(format!("failed to read upload body for '{}': {}", key, e))
                .with_detail("key", key)
        })?;

        total += chunk.len() as u64;
        ensure_size_within(key, total, max_file_size_bytes)?;

        hasher.update(&chunk);
        writer.write_all(&chunk).await.map_err(|e| {
            StorageError::backend(format!("failed to write upload body for '{}': {}", key, e))
                .with_detail("key", key)
        })?;
    }

    writer.flush().await.map_err(|e| {
        StorageError::backend(format!("failed to flush upload body for '{}': {}", key, e))
            .with_detail("key", key)
    })?;

    Ok(CopyStats {
        bytes: total,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

/// A streamed upload body written to an anonymous temporary file so it can be
/// sent with a known length. The file is removed when this value is dropped.
#[derive(Debug)]
pub struct SpooledBody {
    pub file: NamedTempFile,
    pub stats: CopyStats,
}

pub async fn spool_to_tempfile(
    key: &str,
    stream: ObjectStream,
    max_file_size_bytes: u64,
) -> StorageResult<SpooledBody> {
    let spool_err = |e: std::io::Error| {
        StorageError::backend(format!("failed to spool upload body for '{}': {}", key, e))
            .with_detail("key", key)
    };

    let file = NamedTempFile::new().map_err(spool_err)?;
    let handle = file.reopen().map_err(spool_err)?;
    let mut writer = tokio::fs::File::from_std(handle);

    let stats = copy_limited(key, stream, &mut writer, max_file_size_bytes).await?;
    drop(writer);

    debug!("Spooled {} bytes for '{}' to {:?}", stats.bytes, key, file.path());
    Ok(SpooledBody { file, stats })
}

/// Drain a stream into memory. Intended for small objects and tests.
pub async fn collect_stream(mut stream: ObjectStream) -> std::io::Result<Bytes> {
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(buffer))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
