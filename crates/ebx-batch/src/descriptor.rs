//! The "open batch session" descriptor handed to the transport layer

use ebx_core::FileMetadata;
use ebx_crypto::EncryptionInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenBatchSession {
    pub batch_file: BatchFileInfo,
    pub encryption: EncryptionInfo,
}

/// Plaintext archive metadata plus the encrypted parts, in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFileInfo {
    pub file_size: u64,
    pub file_hash: String,
    pub file_parts: Vec<BatchPartInfo>,
}

/// Size and hash of one encrypted part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPartInfo {
    pub ordinal_number: u32,
    pub file_size: u64,
    pub file_hash: String,
}

impl BatchPartInfo {
    pub fn new(ordinal_number: u32, ciphertext: &FileMetadata) -> Self {
        Self {
            ordinal_number,
            file_size: ciphertext.size_bytes,
            file_hash: ciphertext.content_hash.clone(),
        }
    }
}

impl OpenBatchSession {
    pub fn new(
        archive: &FileMetadata,
        encryption: EncryptionInfo,
        file_parts: Vec<BatchPartInfo>,
    ) -> Self {
        Self {
            batch_file: BatchFileInfo {
                file_size: archive.size_bytes,
                file_hash: archive.content_hash.clone(),
                file_parts,
            },
            encryption,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_field_names() {
        let session = OpenBatchSession::new(
            &FileMetadata::new(1000, "YXJjaGl2ZQ=="),
            EncryptionInfo {
                encrypted_symmetric_key: "a2V5".into(),
                initialization_vector: "aXY=".into(),
            },
            vec![
                BatchPartInfo::new(1, &FileMetadata::new(512, "cDE=")),
                BatchPartInfo::new(2, &FileMetadata::new(496, "cDI=")),
            ],
        );

        let json: serde_json::Value = serde_json::from_str(&session.to_json().unwrap()).unwrap();
        assert_eq!(json["batchFile"]["fileSize"], 1000);
        assert_eq!(json["batchFile"]["fileHash"], "YXJjaGl2ZQ==");
        assert_eq!(json["batchFile"]["fileParts"][1]["ordinalNumber"], 2);
        assert_eq!(json["batchFile"]["fileParts"][0]["fileSize"], 512);
        assert_eq!(json["encryption"]["encryptedSymmetricKey"], "a2V5");
        assert_eq!(json["encryption"]["initializationVector"], "aXY=");
    }
}
