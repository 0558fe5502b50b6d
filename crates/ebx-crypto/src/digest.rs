//! Size + SHA-256 metadata for byte slices and streams
//!
//! Every function here is single-pass. Stream variants read from the current
//! position to EOF and never seek, except `compute_metadata_seekable`, which
//! restores the original position afterwards.

use std::io::{Read, Seek, SeekFrom};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ebx_core::{EbxError, EbxResult, FileMetadata};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::DEFAULT_CHUNK_SIZE;

/// Incremental size + SHA-256 accumulator.
#[derive(Clone, Default)]
pub struct MetadataHasher {
    hasher: Sha256,
    size: u64,
}

impl MetadataHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    pub fn finish(self) -> FileMetadata {
        FileMetadata::new(self.size, STANDARD.encode(self.hasher.finalize()))
    }
}

/// Metadata of an in-memory buffer.
pub fn compute_metadata(data: &[u8]) -> FileMetadata {
    let mut hasher = MetadataHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Metadata of everything remaining in `reader`.
pub fn compute_metadata_reader<R: Read>(mut reader: R) -> EbxResult<FileMetadata> {
    let mut hasher = MetadataHasher::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Metadata of the remainder of `reader`; the stream position is restored.
pub fn compute_metadata_seekable<R: Read + Seek>(reader: &mut R) -> EbxResult<FileMetadata> {
    let start = reader.stream_position()?;
    let meta = compute_metadata_reader(&mut *reader)?;
    reader.seek(SeekFrom::Start(start))?;
    Ok(meta)
}

/// Async variant of [`compute_metadata_reader`]. Stops at the next read
/// boundary once `cancel` fires.
pub async fn compute_metadata_async<R: AsyncRead + Unpin>(
    mut reader: R,
    cancel: &CancellationToken,
) -> EbxResult<FileMetadata> {
    let mut hasher = MetadataHasher::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EbxError::Cancelled),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}
