//! ebx-crypto: envelope encryption for e-invoice batches
//!
//! Hybrid scheme: bulk data is AES-256-CBC (PKCS#7) under a random per-batch
//! key and IV; the key travels wrapped with the server's RSA public key.
//!
//! ```text
//! KeyMaterialSource ──fetch──▶ MaterialManager (cache, single-flight refresh)
//!                                 ├── EncryptionEnvelope  key + iv + RSA-OAEP(key)
//!                                 ├── encrypt_token       RSA-OAEP or ECDH/AES-GCM
//!                                 └── generate_csr        PKCS#10, RSA or P-256
//! codec:  plaintext ──AES-256-CBC──▶ ciphertext, SHA-256 of both sides in one pass
//! ```

pub mod codec;
pub mod csr;
pub mod digest;
pub mod envelope;
pub mod material;
pub mod public_key;
pub mod token;

pub use codec::{
    decrypt_bytes, decrypt_stream, decrypt_stream_async, encrypt_bytes, encrypt_stream,
    encrypt_stream_async, padded_len, CipherDigest,
};
pub use csr::{generate_csr, CsrBundle, EnrollmentInfo, KeyAlgorithm};
pub use digest::{
    compute_metadata, compute_metadata_async, compute_metadata_reader, compute_metadata_seekable,
    MetadataHasher,
};
pub use envelope::{EncryptionEnvelope, EncryptionInfo};
pub use material::{
    KeyMaterialSet, KeyMaterialSource, KeyUsage, MaterialManager, MaterialState,
    PublicKeyCertificate,
};
pub use public_key::PublicKeyMaterial;
pub use token::{encrypt_token, token_payload};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// CBC initialization vector size
pub const IV_SIZE: usize = 16;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Read buffer used by the stream paths when the caller does not pick one
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
