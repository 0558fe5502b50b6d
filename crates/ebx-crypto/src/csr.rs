//! PKCS#10 certificate signing requests for enrollment
//!
//! The private key is generated here, returned once inside [`CsrBundle`],
//! and never logged or retained.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ebx_core::{EbxError, EbxResult};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

const OID_GIVEN_NAME: [u64; 4] = [2, 5, 4, 42];
const OID_SURNAME: [u64; 4] = [2, 5, 4, 4];
const OID_SERIAL_NUMBER: [u64; 4] = [2, 5, 4, 5];
const OID_UNIQUE_IDENTIFIER: [u64; 4] = [2, 5, 4, 45];
const OID_ORGANIZATION_IDENTIFIER: [u64; 4] = [2, 5, 4, 97];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

/// Subject attributes supplied by the enrollment service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrollmentInfo {
    pub common_name: String,
    pub country_name: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub serial_number: Option<String>,
    pub unique_identifier: Option<String>,
    pub organization_name: Option<String>,
    pub organization_identifier: Option<String>,
}

impl EnrollmentInfo {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());

        let optional = [
            (DnType::CountryName, &self.country_name),
            (DnType::OrganizationName, &self.organization_name),
            (DnType::CustomDnType(OID_GIVEN_NAME.to_vec()), &self.given_name),
            (DnType::CustomDnType(OID_SURNAME.to_vec()), &self.surname),
            (DnType::CustomDnType(OID_SERIAL_NUMBER.to_vec()), &self.serial_number),
            (
                DnType::CustomDnType(OID_UNIQUE_IDENTIFIER.to_vec()),
                &self.unique_identifier,
            ),
            (
                DnType::CustomDnType(OID_ORGANIZATION_IDENTIFIER.to_vec()),
                &self.organization_identifier,
            ),
        ];
        for (ty, value) in optional {
            if let Some(v) = value {
                dn.push(ty, v.as_str());
            }
        }
        dn
    }
}

/// Base64 DER of the CSR and of the PKCS#8 private key.
pub struct CsrBundle {
    pub csr: String,
    pub private_key: SecretString,
    pub algorithm: KeyAlgorithm,
}

impl std::fmt::Debug for CsrBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrBundle")
            .field("csr_len", &self.csr.len())
            .field("private_key", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Build a CSR for `info` over a freshly generated key pair.
///
/// `rsa_bits` only applies to [`KeyAlgorithm::Rsa`].
pub fn generate_csr(
    info: &EnrollmentInfo,
    algorithm: KeyAlgorithm,
    rsa_bits: usize,
) -> EbxResult<CsrBundle> {
    if info.common_name.is_empty() {
        return Err(EbxError::Crypto("CSR subject requires a common name".into()));
    }

    let key_pair = match algorithm {
        KeyAlgorithm::Rsa => {
            let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, rsa_bits)
                .map_err(|e| EbxError::Crypto(format!("RSA key generation failed: {e}")))?;
            let pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| EbxError::Crypto(format!("encoding RSA key: {e}")))?;
            KeyPair::from_pem(&pem).map_err(csr_err)?
        }
        KeyAlgorithm::Ecdsa => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(csr_err)?,
    };

    let mut params = CertificateParams::default();
    params.distinguished_name = info.distinguished_name();
    let request = params.serialize_request(&key_pair).map_err(csr_err)?;

    tracing::info!(algorithm = ?algorithm, subject = %info.common_name, "generated CSR");

    Ok(CsrBundle {
        csr: STANDARD.encode(request.der()),
        private_key: SecretString::from(STANDARD.encode(key_pair.serialize_der())),
        algorithm,
    })
}

fn csr_err(e: rcgen::Error) -> EbxError {
    EbxError::Crypto(format!("CSR generation failed: {e}"))
}
