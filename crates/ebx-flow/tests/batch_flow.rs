//! Full submission flow against in-process fakes:
//! warm up key material → build a spooled batch → upload throttled parts → poll status.
//!
//! The fake server keeps the RSA private key, so it can unwrap the session key
//! and check that what it received reassembles into the declared archive.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use ebx_batch::{read_archive, BatchEnvelopeBuilder, BatchPart, Document};
use ebx_core::EbxConfig;
use ebx_crypto::{
    compute_metadata, decrypt_bytes, KeyMaterialSource, KeyUsage, MaterialManager,
    PublicKeyCertificate,
};
use ebx_flow::{BatchUploader, PartSubmitter, Poller, RateLimiter, SubmitOutcome, ThrottleSignal};
use parking_lot::Mutex;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
[logging]
level = "debug"

[batch]
io_chunk_size = 1024

[limits]
max_throttle_attempts = 4
upload_concurrency = 3

[limits.endpoints.batch-part]
per_second = 2
per_minute = 0
per_hour = 0

[polling]
max_attempts = 10
backoff = "fixed"
initial_delay_ms = 2000
"#;

struct FakeKeyService {
    spki: Vec<u8>,
    fetches: AtomicU32,
    lifetime: chrono::Duration,
}

impl FakeKeyService {
    fn new(spki: Vec<u8>) -> Self {
        Self {
            spki,
            fetches: AtomicU32::new(0),
            lifetime: chrono::Duration::days(30),
        }
    }
}

#[async_trait]
impl KeyMaterialSource for FakeKeyService {
    async fn fetch(&self) -> anyhow::Result<Vec<PublicKeyCertificate>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(vec![PublicKeyCertificate {
            der: self.spki.clone(),
            valid_from: Utc::now() - chrono::Duration::days(1),
            valid_to: Some(Utc::now() + self.lifetime),
            usage: vec![KeyUsage::SymmetricKeyEncryption, KeyUsage::TokenEncryption],
        }])
    }
}

/// Accepts parts, throttling every part's first submission.
#[derive(Default)]
struct FakeUploadService {
    received: Mutex<BTreeMap<u32, Vec<u8>>>,
    throttled: Mutex<HashSet<u32>>,
}

#[async_trait]
impl PartSubmitter for FakeUploadService {
    async fn submit(&self, part: &BatchPart) -> SubmitOutcome {
        if self.throttled.lock().insert(part.ordinal_number) {
            return SubmitOutcome::Throttled(ThrottleSignal::from_retry_after("1"));
        }
        match part.to_bytes() {
            Ok(bytes) => {
                self.received.lock().insert(part.ordinal_number, bytes.to_vec());
                SubmitOutcome::Accepted
            }
            Err(e) => SubmitOutcome::Rejected(e.into()),
        }
    }
}

fn spki(key: &RsaPrivateKey) -> Vec<u8> {
    key.to_public_key()
        .to_public_key_der()
        .unwrap()
        .as_bytes()
        .to_vec()
}

fn documents() -> Vec<Document> {
    (0..12)
        .map(|i| {
            let xml = format!(
                "<Faktura><Naglowek nr=\"FV/{i:03}\"/>{}</Faktura>",
                "<Wiersz>pozycja</Wiersz>".repeat(40 + i)
            );
            Document::from_bytes(format!("FV-{i:03}.xml"), xml)
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn batch_submission_end_to_end() {
    let config = EbxConfig::parse(CONFIG).unwrap();
    ebx_core::logging::init(&config.logging);
    let cancel = CancellationToken::new();

    let server_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let key_service = Arc::new(FakeKeyService::new(spki(&server_key)));

    // warm up from several tasks at once
    let manager = MaterialManager::from_config(key_service.clone(), &config.crypto);
    let warmups: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.warmup().await })
        })
        .collect();
    for w in warmups {
        w.await.unwrap().unwrap();
    }
    assert_eq!(key_service.fetches.load(Ordering::SeqCst), 1);

    // build, spooled to a scratch dir
    let spool = tempfile::tempdir().unwrap();
    let builder = BatchEnvelopeBuilder::from_config(&config.batch).with_spool_dir(spool.path());
    let batch = builder
        .prepare_async(&manager, &documents(), 5, &cancel)
        .await
        .unwrap();
    assert_eq!(batch.session.batch_file.file_parts.len(), 5);

    // every part is throttled once, and the endpoint admits 2 calls per second
    let limiter = Arc::new(RateLimiter::from_config(&config.limits));
    let uploader = BatchUploader::from_config(limiter, &config.limits);
    let server = FakeUploadService::default();
    let start = tokio::time::Instant::now();
    let report = uploader.upload_all(&batch, &server, &cancel).await.unwrap();
    assert_eq!(report.parts, 5);
    assert_eq!(report.attempts, 10);
    // ten admissions at two per second
    assert!(start.elapsed() >= Duration::from_secs(4));

    // server side: unwrap the key, decrypt each part, reassemble
    let session = &batch.session;
    let wrapped = STANDARD
        .decode(&session.encryption.encrypted_symmetric_key)
        .unwrap();
    let key: [u8; 32] = server_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .unwrap()
        .try_into()
        .unwrap();
    let iv: [u8; 16] = STANDARD
        .decode(&session.encryption.initialization_vector)
        .unwrap()
        .try_into()
        .unwrap();

    let received = server.received.lock();
    assert_eq!(
        received.keys().copied().collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    let mut archive = Vec::new();
    for (info, ciphertext) in session.batch_file.file_parts.iter().zip(received.values()) {
        let meta = compute_metadata(ciphertext);
        assert_eq!(meta.size_bytes, info.file_size);
        assert_eq!(meta.content_hash, info.file_hash);
        archive.extend(decrypt_bytes(ciphertext, &key, &iv).unwrap());
    }
    let archive_meta = compute_metadata(&archive);
    assert_eq!(archive_meta.size_bytes, session.batch_file.file_size);
    assert_eq!(archive_meta.content_hash, session.batch_file.file_hash);
    assert_eq!(read_archive(std::io::Cursor::new(archive)).unwrap().len(), 12);
    drop(received);

    // poll processing status until the fake reports completion
    let probes = AtomicU32::new(0);
    let poller = Poller::from_config(&config.polling).unwrap();
    let start = tokio::time::Instant::now();
    let outcome = poller
        .poll_until(
            || {
                let n = probes.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, anyhow::Error>(if n >= 2 { 200 } else { 100 }) }
            },
            |code: &u32| *code == 200,
            &cancel,
        )
        .await
        .unwrap();
    assert!(outcome.converged);
    assert_eq!(outcome.attempts, 2);
    assert!(start.elapsed() >= Duration::from_secs(2));

    drop(batch);
    assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn batch_before_warmup_is_not_ready() {
    let key_service = Arc::new(FakeKeyService::new(Vec::new()));
    let manager = MaterialManager::from_config(key_service, &Default::default());

    let err = BatchEnvelopeBuilder::new(4096, 1 << 20)
        .prepare(&manager, &documents(), 2)
        .unwrap_err();
    assert!(matches!(err, ebx_core::EbxError::MaterialNotReady));
}

#[tokio::test]
async fn prepare_refreshes_material_near_expiry() {
    let server_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let key_service = Arc::new(FakeKeyService {
        // inside the default five minute refresh margin
        lifetime: chrono::Duration::minutes(2),
        ..FakeKeyService::new(spki(&server_key))
    });
    let manager = MaterialManager::from_config(key_service.clone(), &Default::default());
    manager.warmup().await.unwrap();
    let first = manager.current().unwrap();

    let spool = tempfile::tempdir().unwrap();
    let batch = BatchEnvelopeBuilder::new(4096, 1 << 20)
        .with_spool_dir(spool.path())
        .prepare_async(&manager, &documents(), 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(key_service.fetches.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(&first, &manager.current().unwrap()));
    assert_eq!(batch.parts.len(), 2);
}
