//! Batch envelope builder: archive, split, encrypt each range, describe
//!
//! Two storage modes share one pipeline:
//! - in-memory: archive and parts are `Bytes`
//! - spooled: archive and parts are temp files; each part is a fresh
//!   streaming pass over its byte range of the archive file
//!
//! The `_async` variants run the spooled pipeline off the runtime's worker
//! threads and stop at the next chunk boundary once cancelled.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use ebx_core::config::BatchConfig;
use ebx_core::{EbxError, EbxResult, FileMetadata};
use ebx_crypto::{
    compute_metadata, compute_metadata_async, compute_metadata_seekable, decrypt_stream,
    encrypt_stream, encrypt_stream_async, EncryptionEnvelope, MaterialManager,
};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::{write_archive, Document};
use crate::descriptor::{BatchPartInfo, OpenBatchSession};
use crate::split::{split_ranges, PartRange};

/// Encrypted bytes of one part.
#[derive(Debug)]
pub enum PartPayload {
    Memory(Bytes),
    /// Removed from disk when the part is dropped
    Spooled(NamedTempFile),
}

/// One encrypted upload part.
#[derive(Debug)]
pub struct BatchPart {
    pub ordinal_number: u32,
    pub plaintext_metadata: FileMetadata,
    pub ciphertext_metadata: FileMetadata,
    payload: PartPayload,
}

impl BatchPart {
    pub fn payload(&self) -> &PartPayload {
        &self.payload
    }

    /// Fresh reader over the ciphertext, positioned at its start.
    pub fn open(&self) -> EbxResult<Box<dyn Read + Send>> {
        Ok(match &self.payload {
            PartPayload::Memory(bytes) => Box::new(Cursor::new(bytes.clone())),
            PartPayload::Spooled(file) => Box::new(file.reopen()?),
        })
    }

    pub fn open_async(&self) -> EbxResult<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(match &self.payload {
            PartPayload::Memory(bytes) => Box::new(Cursor::new(bytes.clone())),
            PartPayload::Spooled(file) => Box::new(tokio::fs::File::from_std(file.reopen()?)),
        })
    }

    /// Whole ciphertext in memory. Reads the spool file for spooled parts.
    pub fn to_bytes(&self) -> EbxResult<Bytes> {
        match &self.payload {
            PartPayload::Memory(bytes) => Ok(bytes.clone()),
            PartPayload::Spooled(file) => Ok(Bytes::from(std::fs::read(file.path())?)),
        }
    }

    pub fn info(&self) -> BatchPartInfo {
        BatchPartInfo::new(self.ordinal_number, &self.ciphertext_metadata)
    }
}

/// Everything the transport needs to open a session and upload parts.
///
/// Owns the batch's envelope; dropping the batch zeroizes the key.
#[derive(Debug)]
pub struct PreparedBatch {
    pub session: OpenBatchSession,
    pub archive_metadata: FileMetadata,
    /// In ordinal order, 1:1 with `session.batch_file.file_parts`
    pub parts: Vec<BatchPart>,
    envelope: EncryptionEnvelope,
}

impl PreparedBatch {
    pub fn envelope(&self) -> &EncryptionEnvelope {
        &self.envelope
    }

    pub fn part(&self, ordinal: u32) -> Option<&BatchPart> {
        self.parts.iter().find(|p| p.ordinal_number == ordinal)
    }

    /// Decrypt every part in ordinal order into `out`; returns bytes written.
    ///
    /// Each part is its own CBC stream, so parts are decrypted one at a time
    /// and the plaintexts concatenated.
    pub fn decrypt_parts<W: Write>(&self, mut out: W, chunk_size: usize) -> EbxResult<u64> {
        let mut written = 0;
        for part in &self.parts {
            let digest = decrypt_stream(
                part.open()?,
                &mut out,
                self.envelope.key(),
                self.envelope.iv(),
                chunk_size,
            )?;
            written += digest.plaintext.size_bytes;
        }
        Ok(written)
    }
}

#[derive(Debug, Clone)]
pub struct BatchEnvelopeBuilder {
    chunk_size: usize,
    max_archive_size: u64,
    spool_dir: Option<PathBuf>,
}

impl BatchEnvelopeBuilder {
    pub fn new(chunk_size: usize, max_archive_size: u64) -> Self {
        Self {
            chunk_size,
            max_archive_size,
            spool_dir: None,
        }
    }

    pub fn from_config(cfg: &BatchConfig) -> Self {
        Self {
            chunk_size: cfg.io_chunk_size,
            max_archive_size: cfg.max_archive_size,
            spool_dir: cfg.spool_dir.clone(),
        }
    }

    /// Spool archives and parts into `dir` instead of the system temp dir.
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Take a fresh envelope from `manager` and build the batch. Spools to
    /// disk when a spool directory is configured.
    pub fn prepare(
        &self,
        manager: &MaterialManager,
        documents: &[Document],
        parts: usize,
    ) -> EbxResult<PreparedBatch> {
        let envelope = manager.get_encryption_envelope()?;
        if self.spool_dir.is_some() {
            self.build_spooled(documents, parts, envelope)
        } else {
            self.build(documents, parts, envelope)
        }
    }

    /// Refresh key material if it is near expiry, take a fresh envelope and
    /// build a spooled batch without blocking the runtime.
    pub async fn prepare_async(
        &self,
        manager: &MaterialManager,
        documents: &[Document],
        parts: usize,
        cancel: &CancellationToken,
    ) -> EbxResult<PreparedBatch> {
        manager.ensure_fresh().await?;
        let envelope = manager.get_encryption_envelope()?;
        self.build_spooled_async(documents, parts, envelope, cancel)
            .await
    }

    /// Async [`Self::build_spooled`]. The ZIP is written on the blocking
    /// pool; each part range is then encrypted with cancellation checked at
    /// every chunk. Spool files written so far are removed on cancellation.
    pub async fn build_spooled_async(
        &self,
        documents: &[Document],
        parts: usize,
        envelope: EncryptionEnvelope,
        cancel: &CancellationToken,
    ) -> EbxResult<PreparedBatch> {
        if cancel.is_cancelled() {
            return Err(EbxError::Cancelled);
        }
        let this = self.clone();
        let documents = documents.to_vec();
        let archive = tokio::task::spawn_blocking(move || {
            let archive = this.spool_file("ebx-archive-")?;
            write_archive(&documents, archive)
        })
        .await
        .context("archive writer task failed")??;

        let source = tokio::fs::File::from_std(archive.as_file().try_clone()?);
        self.build_from_async_reader(source, parts, envelope, cancel)
            .await
    }

    /// Async [`Self::build_from_reader`].
    pub async fn build_from_async_reader<R>(
        &self,
        mut archive: R,
        parts: usize,
        envelope: EncryptionEnvelope,
        cancel: &CancellationToken,
    ) -> EbxResult<PreparedBatch>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        archive.seek(SeekFrom::Start(0)).await?;
        let archive_metadata = compute_metadata_async(&mut archive, cancel).await?;
        self.check_archive_size(archive_metadata.size_bytes)?;

        let mut batch_parts = Vec::with_capacity(parts);
        for range in split_ranges(archive_metadata.size_bytes, parts)? {
            batch_parts.push(
                self.encrypt_range_async(&mut archive, range, &envelope, cancel)
                    .await?,
            );
        }

        Ok(self.finish(archive_metadata, batch_parts, envelope, true))
    }

    /// Build with the archive and all parts held in memory.
    pub fn build(
        &self,
        documents: &[Document],
        parts: usize,
        envelope: EncryptionEnvelope,
    ) -> EbxResult<PreparedBatch> {
        let archive = write_archive(documents, Cursor::new(Vec::new()))?.into_inner();
        let archive_metadata = compute_metadata(&archive);
        self.check_archive_size(archive_metadata.size_bytes)?;

        let mut batch_parts = Vec::with_capacity(parts);
        for range in split_ranges(archive_metadata.size_bytes, parts)? {
            let plaintext = &archive[range.offset as usize..range.end() as usize];
            let mut ciphertext = Vec::with_capacity(ebx_crypto::padded_len(range.len) as usize);
            let digest = encrypt_stream(
                plaintext,
                &mut ciphertext,
                envelope.key(),
                envelope.iv(),
                self.chunk_size,
            )?;
            batch_parts.push(BatchPart {
                ordinal_number: range.ordinal,
                plaintext_metadata: digest.plaintext,
                ciphertext_metadata: digest.ciphertext,
                payload: PartPayload::Memory(Bytes::from(ciphertext)),
            });
        }

        Ok(self.finish(archive_metadata, batch_parts, envelope, false))
    }

    /// Build with the archive and parts spooled to temp files.
    pub fn build_spooled(
        &self,
        documents: &[Document],
        parts: usize,
        envelope: EncryptionEnvelope,
    ) -> EbxResult<PreparedBatch> {
        let archive = self.spool_file("ebx-archive-")?;
        let mut archive = write_archive(documents, archive)?;
        // `archive` is deleted on drop, after every part is written
        self.build_from_reader(archive.as_file_mut(), parts, envelope)
    }

    /// Build spooled parts from an existing seekable archive.
    ///
    /// The source is read once for its metadata and once per part range.
    pub fn build_from_reader<R: Read + Seek>(
        &self,
        mut archive: R,
        parts: usize,
        envelope: EncryptionEnvelope,
    ) -> EbxResult<PreparedBatch> {
        archive.seek(SeekFrom::Start(0))?;
        let archive_metadata = compute_metadata_seekable(&mut archive)?;
        self.check_archive_size(archive_metadata.size_bytes)?;

        let mut batch_parts = Vec::with_capacity(parts);
        for range in split_ranges(archive_metadata.size_bytes, parts)? {
            batch_parts.push(self.encrypt_range_spooled(&mut archive, range, &envelope)?);
        }

        Ok(self.finish(archive_metadata, batch_parts, envelope, true))
    }

    fn encrypt_range_spooled<R: Read + Seek>(
        &self,
        archive: &mut R,
        range: PartRange,
        envelope: &EncryptionEnvelope,
    ) -> EbxResult<BatchPart> {
        archive.seek(SeekFrom::Start(range.offset))?;
        let mut part_file = self.spool_file("ebx-part-")?;
        let digest = encrypt_stream(
            archive.by_ref().take(range.len),
            part_file.as_file_mut(),
            envelope.key(),
            envelope.iv(),
            self.chunk_size,
        )?;
        check_range_read(&range, digest.plaintext.size_bytes)?;
        debug!(
            ordinal = range.ordinal,
            offset = range.offset,
            bytes = digest.ciphertext.size_bytes,
            "part spooled"
        );
        Ok(BatchPart {
            ordinal_number: range.ordinal,
            plaintext_metadata: digest.plaintext,
            ciphertext_metadata: digest.ciphertext,
            payload: PartPayload::Spooled(part_file),
        })
    }

    async fn encrypt_range_async<R: AsyncRead + AsyncSeek + Unpin>(
        &self,
        archive: &mut R,
        range: PartRange,
        envelope: &EncryptionEnvelope,
        cancel: &CancellationToken,
    ) -> EbxResult<BatchPart> {
        archive.seek(SeekFrom::Start(range.offset)).await?;
        let part_file = self.spool_file("ebx-part-")?;
        let mut sink = tokio::fs::File::from_std(part_file.as_file().try_clone()?);
        let digest = encrypt_stream_async(
            archive.take(range.len),
            &mut sink,
            envelope.key(),
            envelope.iv(),
            self.chunk_size,
            cancel,
        )
        .await?;
        check_range_read(&range, digest.plaintext.size_bytes)?;
        debug!(
            ordinal = range.ordinal,
            offset = range.offset,
            bytes = digest.ciphertext.size_bytes,
            "part spooled"
        );
        Ok(BatchPart {
            ordinal_number: range.ordinal,
            plaintext_metadata: digest.plaintext,
            ciphertext_metadata: digest.ciphertext,
            payload: PartPayload::Spooled(part_file),
        })
    }

    fn finish(
        &self,
        archive_metadata: FileMetadata,
        parts: Vec<BatchPart>,
        envelope: EncryptionEnvelope,
        spooled: bool,
    ) -> PreparedBatch {
        let session = OpenBatchSession::new(
            &archive_metadata,
            envelope.encryption_info(),
            parts.iter().map(BatchPart::info).collect(),
        );
        info!(
            archive_bytes = archive_metadata.size_bytes,
            parts = parts.len(),
            spooled,
            "batch prepared"
        );
        PreparedBatch {
            session,
            archive_metadata,
            parts,
            envelope,
        }
    }

    fn check_archive_size(&self, size: u64) -> EbxResult<()> {
        if size > self.max_archive_size {
            return Err(EbxError::ArchiveTooLarge {
                size,
                limit: self.max_archive_size,
            });
        }
        Ok(())
    }

    fn spool_file(&self, prefix: &str) -> EbxResult<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        Ok(match &self.spool_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        })
    }
}

fn check_range_read(range: &PartRange, read: u64) -> EbxResult<()> {
    if read != range.len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "archive ended inside part {}: read {} of {} bytes",
                range.ordinal, read, range.len
            ),
        )
        .into());
    }
    Ok(())
}
