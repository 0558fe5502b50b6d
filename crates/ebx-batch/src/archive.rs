//! ZIP packaging of batch documents

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use ebx_core::{EbxError, EbxResult};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Where a document's bytes come from.
#[derive(Debug, Clone)]
pub enum DocumentBody {
    Bytes(Bytes),
    /// Streamed from disk while the archive is written
    File(PathBuf),
}

/// One named entry of a batch archive.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub body: DocumentBody,
}

impl Document {
    pub fn from_bytes(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            body: DocumentBody::Bytes(content.into()),
        }
    }

    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            body: DocumentBody::File(path.into()),
        }
    }
}

/// Write `documents` as a deflate ZIP into `sink` and return the sink.
///
/// Names must be unique; order is preserved but not significant.
pub fn write_archive<W: Write + Seek>(documents: &[Document], sink: W) -> EbxResult<W> {
    if documents.is_empty() {
        return Err(EbxError::EmptyBatch);
    }

    let mut seen = HashSet::with_capacity(documents.len());
    let mut zip = ZipWriter::new(sink);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for doc in documents {
        if !seen.insert(doc.name.as_str()) {
            return Err(EbxError::DuplicateDocument(doc.name.clone()));
        }
        zip.start_file(doc.name.as_str(), options)
            .with_context(|| format!("adding {} to archive", doc.name))?;
        match &doc.body {
            DocumentBody::Bytes(content) => zip.write_all(content)?,
            DocumentBody::File(path) => {
                let mut file = File::open(path)?;
                io::copy(&mut file, &mut zip)?;
            }
        }
    }

    let sink = zip.finish().context("finishing archive")?;
    tracing::debug!(documents = documents.len(), "archive written");
    Ok(sink)
}

/// Read every entry of a ZIP archive into memory.
pub fn read_archive<R: Read + Seek>(source: R) -> EbxResult<Vec<(String, Vec<u8>)>> {
    let mut zip = ZipArchive::new(source).context("opening archive")?;
    let mut entries = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("reading archive entry")?;
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        entries.push((entry.name().to_string(), content));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn archive_preserves_documents() {
        let docs = vec![
            Document::from_bytes("inv-001.xml", "<Faktura>1</Faktura>"),
            Document::from_bytes("inv-002.xml", "<Faktura>2</Faktura>"),
        ];
        let archive = write_archive(&docs, Cursor::new(Vec::new()))
            .unwrap()
            .into_inner();

        let entries = read_archive(Cursor::new(archive)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "inv-001.xml");
        assert_eq!(entries[1].1, b"<Faktura>2</Faktura>");
    }

    #[test]
    fn file_bodies_are_streamed_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.xml");
        let content = vec![b'x'; 300_000];
        std::fs::write(&path, &content).unwrap();

        let docs = vec![Document::from_path("big.xml", &path)];
        let archive = write_archive(&docs, Cursor::new(Vec::new()))
            .unwrap()
            .into_inner();

        // highly compressible input must come out deflated
        assert!(archive.len() < content.len() / 10);
        let entries = read_archive(Cursor::new(archive)).unwrap();
        assert_eq!(entries[0].1, content);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let result = write_archive(&[], Cursor::new(Vec::new()));
        assert!(matches!(result, Err(EbxError::EmptyBatch)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let docs = vec![
            Document::from_bytes("a.xml", "1"),
            Document::from_bytes("a.xml", "2"),
        ];
        let result = write_archive(&docs, Cursor::new(Vec::new()));
        assert!(matches!(result, Err(EbxError::DuplicateDocument(ref n)) if n == "a.xml"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let docs = vec![Document::from_path("gone.xml", "/nonexistent/ebx/gone.xml")];
        let result = write_archive(&docs, Cursor::new(Vec::new()));
        assert!(matches!(result, Err(EbxError::Io(_))));
    }
}
