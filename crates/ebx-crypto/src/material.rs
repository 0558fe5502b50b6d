//! Public-key material cache with single-flight warm-up and refresh
//!
//! State machine (derived, never stored):
//! ```text
//! Uninitialized ──warmup──▶ Warming ──ok──▶ Ready ⇄ Refreshing
//!        ▲                     │
//!        └──────fetch error────┘
//! ```
//! `Refreshing` always lands back in `Ready`: a failed refresh keeps the
//! previous set. The cache slot holds an `Arc<KeyMaterialSet>` that is
//! replaced wholesale, so readers see either the old or the new set.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ebx_core::config::CryptoConfig;
use ebx_core::{EbxError, EbxResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::csr::{self, CsrBundle, EnrollmentInfo, KeyAlgorithm};
use crate::envelope::EncryptionEnvelope;
use crate::public_key::PublicKeyMaterial;
use crate::token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    /// Wrapping batch/session symmetric keys
    SymmetricKeyEncryption,
    /// Encrypting authentication tokens
    TokenEncryption,
}

/// One entry of the server's public key listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyCertificate {
    /// X.509 certificate or SubjectPublicKeyInfo, DER
    pub der: Vec<u8>,
    pub valid_from: DateTime<Utc>,
    /// `None` means no expiry
    pub valid_to: Option<DateTime<Utc>>,
    pub usage: Vec<KeyUsage>,
}

impl PublicKeyCertificate {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && self.valid_to.map_or(true, |to| now < to)
    }
}

/// Fetches the current public key listing from the service.
#[async_trait]
pub trait KeyMaterialSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<Vec<PublicKeyCertificate>>;
}

/// Parsed key selected for one usage.
#[derive(Debug, Clone)]
pub struct ActiveMaterial {
    pub key: PublicKeyMaterial,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl ActiveMaterial {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_to.is_some_and(|to| now >= to)
    }
}

/// The material in effect after one successful fetch.
#[derive(Debug, Clone)]
pub struct KeyMaterialSet {
    pub symmetric: ActiveMaterial,
    pub token: ActiveMaterial,
    pub fetched_at: DateTime<Utc>,
}

impl KeyMaterialSet {
    /// Pick, per usage, the newest entry valid at `now` that parses.
    pub fn select(entries: &[PublicKeyCertificate], now: DateTime<Utc>) -> EbxResult<Self> {
        Ok(Self {
            symmetric: select_usage(entries, KeyUsage::SymmetricKeyEncryption, now)?,
            token: select_usage(entries, KeyUsage::TokenEncryption, now)?,
            fetched_at: now,
        })
    }

    /// Earliest `valid_to` across the selected entries.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match (self.symmetric.valid_to, self.token.valid_to) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn select_usage(
    entries: &[PublicKeyCertificate],
    usage: KeyUsage,
    now: DateTime<Utc>,
) -> EbxResult<ActiveMaterial> {
    let mut candidates: Vec<&PublicKeyCertificate> = entries
        .iter()
        .filter(|e| e.usage.contains(&usage) && e.is_valid_at(now))
        .collect();
    candidates.sort_by(|a, b| b.valid_from.cmp(&a.valid_from));

    for entry in candidates {
        match PublicKeyMaterial::from_der(&entry.der) {
            Ok(key) => {
                return Ok(ActiveMaterial {
                    key,
                    valid_from: entry.valid_from,
                    valid_to: entry.valid_to,
                })
            }
            Err(e) => warn!(?usage, valid_from = %entry.valid_from, "skipping unusable key material: {e}"),
        }
    }
    Err(EbxError::MaterialUnavailable(format!(
        "no valid key material for {usage:?}"
    )))
}

/// Derived lifecycle state of a [`MaterialManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialState {
    Uninitialized,
    Warming,
    Ready,
    Refreshing,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<KeyMaterialSet>, String>>>;

struct Inner {
    source: Arc<dyn KeyMaterialSource>,
    cache: RwLock<Option<Arc<KeyMaterialSet>>>,
    in_flight: Mutex<Option<SharedFetch>>,
    refresh_margin: chrono::Duration,
    rsa_key_bits: usize,
}

impl Inner {
    async fn fetch_and_swap(self: Arc<Self>) -> Result<Arc<KeyMaterialSet>, String> {
        debug!("fetching public key material");
        let entries = self.source.fetch().await.map_err(|e| format!("{e:#}"))?;
        let set = KeyMaterialSet::select(&entries, Utc::now()).map_err(|e| match e {
            EbxError::MaterialUnavailable(reason) => reason,
            other => other.to_string(),
        })?;
        let set = Arc::new(set);
        *self.cache.write() = Some(Arc::clone(&set));
        info!(
            entries = entries.len(),
            symmetric = set.symmetric.key.algorithm(),
            token = set.token.key.algorithm(),
            "key material installed"
        );
        Ok(set)
    }
}

/// Owns the key material cache and everything that needs it.
///
/// Cheap to clone; clones share one cache and one in-flight fetch.
#[derive(Clone)]
pub struct MaterialManager {
    inner: Arc<Inner>,
}

impl MaterialManager {
    pub fn new(
        source: Arc<dyn KeyMaterialSource>,
        refresh_margin: chrono::Duration,
        rsa_key_bits: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                cache: RwLock::new(None),
                in_flight: Mutex::new(None),
                refresh_margin,
                rsa_key_bits,
            }),
        }
    }

    pub fn from_config(source: Arc<dyn KeyMaterialSource>, cfg: &CryptoConfig) -> Self {
        let secs = i64::try_from(cfg.refresh_margin_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        Self::new(source, chrono::Duration::seconds(secs), cfg.rsa_key_bits)
    }

    /// Populate the cache once. Concurrent callers share one fetch.
    pub async fn warmup(&self) -> EbxResult<()> {
        if self.is_warmed_up() {
            return Ok(());
        }
        match self.fetch_single_flight().await {
            Ok(_) => Ok(()),
            // a concurrent refresh may have failed after an earlier success
            Err(reason) if self.is_warmed_up() => {
                warn!("warmup fetch failed, using cached material: {reason}");
                Ok(())
            }
            Err(reason) => Err(EbxError::MaterialUnavailable(reason)),
        }
    }

    /// Fetch again regardless of cache state. On failure the previous
    /// material stays active and `RefreshFailed` is returned.
    pub async fn force_refresh(&self) -> EbxResult<()> {
        match self.fetch_single_flight().await {
            Ok(_) => Ok(()),
            Err(reason) if self.is_warmed_up() => {
                warn!("key material refresh failed, keeping previous set: {reason}");
                Err(EbxError::RefreshFailed(reason))
            }
            Err(reason) => Err(EbxError::MaterialUnavailable(reason)),
        }
    }

    /// Warm up if needed, and refresh when the selected material expires
    /// within the refresh margin. A failed refresh degrades to the cached set
    /// while that set is still valid; once it has expired the failure surfaces.
    pub async fn ensure_fresh(&self) -> EbxResult<()> {
        let Some(set) = self.current() else {
            return self.warmup().await;
        };
        let due = set
            .expires_at()
            .is_some_and(|to| {
                Utc::now()
                    .checked_add_signed(self.inner.refresh_margin)
                    .map_or(true, |horizon| horizon >= to)
            });
        if !due {
            return Ok(());
        }
        debug!(expires_at = ?set.expires_at(), "key material near expiry, refreshing");
        match self.force_refresh().await {
            Err(EbxError::RefreshFailed(reason)) => match self.current() {
                Some(set) if set.expires_at().map_or(true, |to| Utc::now() < to) => Ok(()),
                _ => Err(EbxError::MaterialUnavailable(format!(
                    "key material expired and refresh failed: {reason}"
                ))),
            },
            other => other,
        }
    }

    pub fn is_warmed_up(&self) -> bool {
        self.inner.cache.read().is_some()
    }

    pub fn state(&self) -> MaterialState {
        let fetching = self
            .inner
            .in_flight
            .lock()
            .as_ref()
            .is_some_and(|f| f.peek().is_none());
        match (self.is_warmed_up(), fetching) {
            (false, false) => MaterialState::Uninitialized,
            (false, true) => MaterialState::Warming,
            (true, false) => MaterialState::Ready,
            (true, true) => MaterialState::Refreshing,
        }
    }

    /// Snapshot of the active set.
    pub fn current(&self) -> Option<Arc<KeyMaterialSet>> {
        self.inner.cache.read().clone()
    }

    /// Fresh key + IV wrapped under the symmetric-key-encryption material.
    ///
    /// Never wraps under expired material; call [`Self::ensure_fresh`] first
    /// in long-running processes.
    pub fn get_encryption_envelope(&self) -> EbxResult<EncryptionEnvelope> {
        let set = self.current().ok_or(EbxError::MaterialNotReady)?;
        let material = unexpired(&set.symmetric, KeyUsage::SymmetricKeyEncryption)?;
        EncryptionEnvelope::generate(&material.key)
    }

    /// Encrypt a short value under the token-encryption material.
    pub fn encrypt_opaque_token(&self, plaintext: &[u8]) -> EbxResult<Vec<u8>> {
        let set = self.current().ok_or(EbxError::MaterialNotReady)?;
        let material = unexpired(&set.token, KeyUsage::TokenEncryption)?;
        token::encrypt_token(&material.key, plaintext)
    }

    pub fn generate_csr(
        &self,
        info: &EnrollmentInfo,
        algorithm: KeyAlgorithm,
    ) -> EbxResult<CsrBundle> {
        csr::generate_csr(info, algorithm, self.inner.rsa_key_bits)
    }

    async fn fetch_single_flight(&self) -> Result<Arc<KeyMaterialSet>, String> {
        let fetch = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(pending) if pending.peek().is_none() => pending.clone(),
                _ => {
                    let inner = Arc::clone(&self.inner);
                    let fetch = inner.fetch_and_swap().boxed().shared();
                    *slot = Some(fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;

        let mut slot = self.inner.in_flight.lock();
        if slot.as_ref().is_some_and(|f| f.ptr_eq(&fetch)) {
            *slot = None;
        }
        result
    }
}

fn unexpired(material: &ActiveMaterial, usage: KeyUsage) -> EbxResult<&ActiveMaterial> {
    let now = Utc::now();
    if material.is_expired_at(now) {
        warn!(?usage, valid_to = ?material.valid_to, "cached key material has expired");
        return Err(EbxError::MaterialUnavailable(format!(
            "{usage:?} material expired at {}",
            material.valid_to.map(|t| t.to_rfc3339()).unwrap_or_default()
        )));
    }
    Ok(material)
}

impl std::fmt::Debug for MaterialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialManager")
            .field("state", &self.state())
            .finish()
    }
}
