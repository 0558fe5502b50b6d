//! Server public-key material: X.509 certificate or bare SubjectPublicKeyInfo,
//! RSA or EC P-256.

use ebx_core::{EbxError, EbxResult};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

#[derive(Debug, Clone)]
pub enum PublicKeyMaterial {
    Rsa(RsaPublicKey),
    EcP256(p256::PublicKey),
}

impl PublicKeyMaterial {
    /// Parse DER that is either a certificate or a SubjectPublicKeyInfo.
    pub fn from_der(der: &[u8]) -> EbxResult<Self> {
        match Certificate::from_der(der) {
            Ok(cert) => {
                let spki = cert
                    .tbs_certificate
                    .subject_public_key_info
                    .to_der()
                    .map_err(|e| EbxError::Crypto(format!("re-encoding certificate key: {e}")))?;
                Self::from_spki_der(&spki)
            }
            Err(_) => Self::from_spki_der(der),
        }
    }

    pub fn from_spki_der(spki: &[u8]) -> EbxResult<Self> {
        if let Ok(key) = RsaPublicKey::from_public_key_der(spki) {
            return Ok(Self::Rsa(key));
        }
        if let Ok(key) = <p256::PublicKey as p256::pkcs8::DecodePublicKey>::from_public_key_der(spki) {
            return Ok(Self::EcP256(key));
        }
        Err(EbxError::Crypto(
            "key material is neither an RSA nor a P-256 certificate or public key".into(),
        ))
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RSA",
            Self::EcP256(_) => "EC-P256",
        }
    }

    /// RSA-OAEP (SHA-256, MGF1-SHA-256) encryption of a short secret.
    pub fn encrypt_oaep(&self, secret: &[u8]) -> EbxResult<Vec<u8>> {
        match self {
            Self::Rsa(key) => key
                .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), secret)
                .map_err(|e| EbxError::Crypto(format!("RSA-OAEP encryption failed: {e}"))),
            Self::EcP256(_) => Err(EbxError::Crypto(
                "RSA-OAEP requires RSA key material, got EC-P256".into(),
            )),
        }
    }
}
