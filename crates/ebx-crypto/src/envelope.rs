//! Per-batch symmetric key, IV, and the wrapped key sent to the server

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ebx_core::EbxResult;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::public_key::PublicKeyMaterial;
use crate::{IV_SIZE, KEY_SIZE};

/// AES-256 key + CBC IV for one batch, plus the key wrapped for the server.
///
/// Not `Clone`: an envelope belongs to exactly one batch. Key and IV are
/// zeroized on drop.
pub struct EncryptionEnvelope {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    wrapped_key: Vec<u8>,
}

/// Wire form of an envelope for the open-session descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionInfo {
    /// base64 RSA-OAEP ciphertext of the symmetric key
    pub encrypted_symmetric_key: String,
    /// base64 IV
    pub initialization_vector: String,
}

impl EncryptionEnvelope {
    /// Fresh random key and IV, key wrapped with RSA-OAEP under `material`.
    pub fn generate(material: &PublicKeyMaterial) -> EbxResult<Self> {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        let wrapped_key = match material.encrypt_oaep(&key) {
            Ok(w) => w,
            Err(e) => {
                key.zeroize();
                return Err(e);
            }
        };
        Ok(Self {
            key,
            iv,
            wrapped_key,
        })
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    pub fn encryption_info(&self) -> EncryptionInfo {
        EncryptionInfo {
            encrypted_symmetric_key: STANDARD.encode(&self.wrapped_key),
            initialization_vector: STANDARD.encode(self.iv),
        }
    }
}

impl Drop for EncryptionEnvelope {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for EncryptionEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionEnvelope")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .field("wrapped_key_len", &self.wrapped_key.len())
            .finish()
    }
}
