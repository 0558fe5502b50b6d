//! ebx-batch: turns a set of documents into an encrypted, part-split upload
//!
//! # Pipeline
//! ```text
//! documents ──zip──▶ archive ──split into N ranges──▶ AES-256-CBC per range ──▶ BatchPart[1..=N]
//!                       │                                                          │
//!                       └──── FileMetadata ───────▶ OpenBatchSession ◀── per-part metadata
//! ```
//! Every range is encrypted as its own CBC stream under the batch envelope's
//! key and IV, so parts can be encrypted, uploaded and decrypted in any order.

pub mod archive;
pub mod builder;
pub mod descriptor;
pub mod split;

pub use archive::{read_archive, write_archive, Document, DocumentBody};
pub use builder::{BatchEnvelopeBuilder, BatchPart, PartPayload, PreparedBatch};
pub use descriptor::{BatchFileInfo, BatchPartInfo, OpenBatchSession};
pub use split::{parts_for_size, split_ranges, PartRange};
