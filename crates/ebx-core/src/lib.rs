//! ebx-core: shared types, config schema, error taxonomy, and logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::EbxConfig;
pub use error::{EbxError, EbxResult};
pub use types::FileMetadata;
