//! Encryption of short opaque values (authentication tokens) for the server
//!
//! RSA material: RSA-OAEP with SHA-256.
//! EC P-256 material: ephemeral ECDH, the raw shared secret keys AES-256-GCM.
//! Output: `[91-byte ephemeral SPKI DER][12-byte nonce][ciphertext + 16-byte tag]`

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use ebx_core::{EbxError, EbxResult};
use p256::ecdh::EphemeralSecret;
use p256::pkcs8::EncodePublicKey;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::public_key::PublicKeyMaterial;

/// AES-GCM nonce size
pub const GCM_NONCE_SIZE: usize = 12;

/// Encrypt `plaintext` for the holder of `material`'s private key.
pub fn encrypt_token(material: &PublicKeyMaterial, plaintext: &[u8]) -> EbxResult<Vec<u8>> {
    match material {
        PublicKeyMaterial::Rsa(_) => material.encrypt_oaep(plaintext),
        PublicKeyMaterial::EcP256(peer) => seal_ecdh(peer, plaintext),
    }
}

/// The conventional token plaintext: `"<token>|<unix millis>"`.
pub fn token_payload(token: &str, at: DateTime<Utc>) -> String {
    format!("{token}|{}", at.timestamp_millis())
}

fn seal_ecdh(peer: &p256::PublicKey, plaintext: &[u8]) -> EbxResult<Vec<u8>> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_spki = ephemeral
        .public_key()
        .to_public_key_der()
        .map_err(|e| EbxError::Crypto(format!("encoding ephemeral key: {e}")))?;

    let shared = ephemeral.diffie_hellman(peer);
    let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes())
        .map_err(|e| EbxError::Crypto(format!("ECDH key: {e}")))?;

    let mut nonce_bytes = [0u8; GCM_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| EbxError::Crypto(format!("token encryption failed: {e}")))?;

    let spki = ephemeral_spki.as_bytes();
    let mut out = Vec::with_capacity(spki.len() + GCM_NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(spki);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}
