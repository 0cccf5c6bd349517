//! Barrier key hierarchy.
//!
//! Three persisted tiers (root → intermediate → content) under an unseal key
//! that only ever exists in memory, reconstructed from Shamir shares. Every
//! persisted record carries an HMAC verified on load; a mismatch forces
//! sealing. Rotation at any tier creates a new current key while prior keys
//! stay decrypt-only until an explicit retire.

pub mod envelope;
pub mod shamir;

use std::collections::HashMap;

use sqlx::AnyPool;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use zeroize::Zeroizing;

use crypto_core::aead::AeadAlgorithm;
use crypto_core::digest::DigestAlgorithm;

use crate::clock::now_nanos;
use crate::db::{self, DbError};
use crate::models::{BarrierKeyRecord, KeyTier};

const TIER_ALGORITHM: &str = "AES-256-GCM";
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("barrier is sealed")]
    Sealed,

    #[error("barrier integrity check failed")]
    IntegrityFailed,

    #[error("barrier key not found")]
    KeyNotFound,

    #[error("unsupported algorithm: {0}")]
    AlgorithmUnsupported(String),

    #[error("rotation already in progress")]
    RotationInProgress,

    #[error("invalid unseal share")]
    InvalidShare,

    #[error("barrier already initialized")]
    AlreadyInitialized,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Crypto(#[from] crypto_core::CryptoError),
}

/// Barrier lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Sealed,
    Unsealing,
    Unsealed,
    Sealing,
}

impl BarrierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarrierState::Sealed => "sealed",
            BarrierState::Unsealing => "unsealing",
            BarrierState::Unsealed => "unsealed",
            BarrierState::Sealing => "sealing",
        }
    }
}

/// Unseal progress reported to the admin API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UnsealStatus {
    pub state: &'static str,
    pub shares_provided: usize,
    pub threshold: u8,
}

struct TierKey {
    tier: KeyTier,
    material: Zeroizing<Vec<u8>>,
}

/// In-memory key cache, present only while unsealed.
struct Keyring {
    /// HKDF(unseal, "integrity"); MACs every persisted record.
    integrity_key: Zeroizing<Vec<u8>>,
    /// HKDF(unseal, "root-wrap"); seals root records.
    root_wrap_key: Zeroizing<Vec<u8>>,
    keys: HashMap<String, TierKey>,
    current_root: String,
    current_intermediate: String,
    current_content: String,
}

impl Keyring {
    fn current_id(&self, tier: KeyTier) -> &str {
        match tier {
            KeyTier::Root => &self.current_root,
            KeyTier::Intermediate => &self.current_intermediate,
            KeyTier::Content => &self.current_content,
        }
    }

    fn set_current(&mut self, tier: KeyTier, id: String) {
        match tier {
            KeyTier::Root => self.current_root = id,
            KeyTier::Intermediate => self.current_intermediate = id,
            KeyTier::Content => self.current_content = id,
        }
    }
}

struct Inner {
    state: BarrierState,
    keyring: Option<Keyring>,
}

/// The barrier. All crypto service paths go through here; while sealed every
/// operation returns [`BarrierError::Sealed`].
pub struct Barrier {
    pool: AnyPool,
    shares: u8,
    threshold: u8,
    inner: RwLock<Inner>,
    progress: Mutex<Vec<shamir::Share>>,
    rotation_root: Mutex<()>,
    rotation_intermediate: Mutex<()>,
    rotation_content: Mutex<()>,
}

impl Barrier {
    pub fn new(pool: AnyPool, shares: u8, threshold: u8) -> Self {
        Self {
            pool,
            shares,
            threshold,
            inner: RwLock::new(Inner {
                state: BarrierState::Sealed,
                keyring: None,
            }),
            progress: Mutex::new(Vec::new()),
            rotation_root: Mutex::new(()),
            rotation_intermediate: Mutex::new(()),
            rotation_content: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> BarrierState {
        self.inner.read().await.state
    }

    pub async fn is_unsealed(&self) -> bool {
        self.state().await == BarrierState::Unsealed
    }

    pub async fn is_initialized(&self) -> Result<bool, BarrierError> {
        Ok(db::barrier_keys::any_exist(&self.pool).await?)
    }

    pub async fn status(&self) -> UnsealStatus {
        let state = self.state().await;
        let shares_provided = self.progress.lock().await.len();
        UnsealStatus {
            state: state.as_str(),
            shares_provided,
            threshold: self.threshold,
        }
    }

    /// First-start initialization: generate the unseal key, split it into
    /// shares, create one key per tier, and come up unsealed. The share
    /// strings are returned exactly once and never persisted.
    pub async fn initialize(&self) -> Result<Vec<String>, BarrierError> {
        if self.is_initialized().await? {
            return Err(BarrierError::AlreadyInitialized);
        }

        let unseal_key = Zeroizing::new(crypto_core::random_bytes(KEY_LEN));
        let shares = shamir::split(&unseal_key, self.shares, self.threshold)?;

        let mut keyring = derive_keyring(&unseal_key)?;
        let now = now_nanos();

        let root = new_tier_key(KeyTier::Root);
        let root_record = seal_record(
            &keyring,
            &root,
            None,
            &keyring.root_wrap_key.clone(),
            now,
        )?;
        db::barrier_keys::insert(&self.pool, &root_record).await?;

        let intermediate = new_tier_key(KeyTier::Intermediate);
        let intermediate_record = seal_record(
            &keyring,
            &intermediate,
            Some(&root_record.id),
            &root.1,
            now,
        )?;
        db::barrier_keys::insert(&self.pool, &intermediate_record).await?;

        let content = new_tier_key(KeyTier::Content);
        let content_record = seal_record(
            &keyring,
            &content,
            Some(&intermediate_record.id),
            &intermediate.1,
            now,
        )?;
        db::barrier_keys::insert(&self.pool, &content_record).await?;

        keyring.keys.insert(
            root_record.id.clone(),
            TierKey {
                tier: KeyTier::Root,
                material: root.1,
            },
        );
        keyring.keys.insert(
            intermediate_record.id.clone(),
            TierKey {
                tier: KeyTier::Intermediate,
                material: intermediate.1,
            },
        );
        keyring.keys.insert(
            content_record.id.clone(),
            TierKey {
                tier: KeyTier::Content,
                material: content.1,
            },
        );
        keyring.current_root = root_record.id;
        keyring.current_intermediate = intermediate_record.id;
        keyring.current_content = content_record.id;

        let mut inner = self.inner.write().await;
        inner.keyring = Some(keyring);
        inner.state = BarrierState::Unsealed;

        tracing::info!(shares = self.shares, threshold = self.threshold, "barrier initialized");
        Ok(shares.iter().map(shamir::Share::encode).collect())
    }

    /// Submit one unseal share. When the threshold is reached the assembled
    /// key is verified by decrypting the stored root key; surplus shares
    /// beyond the threshold are ignored.
    pub async fn submit_share(&self, encoded: &str) -> Result<UnsealStatus, BarrierError> {
        {
            let state = self.state().await;
            if state == BarrierState::Unsealed {
                return Ok(self.status().await);
            }
        }

        let share = shamir::Share::decode(encoded)?;

        let attempt = {
            let mut progress = self.progress.lock().await;
            if !progress.iter().any(|s| s.index == share.index) {
                progress.push(share);
            }
            if progress.len() >= self.threshold as usize {
                Some(progress[..self.threshold as usize].to_vec())
            } else {
                None
            }
        };

        match attempt {
            None => {
                let mut inner = self.inner.write().await;
                if inner.state == BarrierState::Sealed {
                    inner.state = BarrierState::Unsealing;
                }
                drop(inner);
                Ok(self.status().await)
            }
            Some(shares) => {
                let result = self.try_unseal(&shares).await;
                self.progress.lock().await.clear();
                match result {
                    Ok(()) => Ok(self.status().await),
                    Err(err) => {
                        let mut inner = self.inner.write().await;
                        inner.state = BarrierState::Sealed;
                        inner.keyring = None;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn try_unseal(&self, shares: &[shamir::Share]) -> Result<(), BarrierError> {
        let unseal_key = shamir::combine(shares)?;
        let mut keyring = derive_keyring(&unseal_key)?;

        // Roots first: sealed under the unseal-derived wrap key.
        let root_records = db::barrier_keys::list_tier(&self.pool, KeyTier::Root.as_str()).await?;
        if root_records.is_empty() {
            return Err(BarrierError::KeyNotFound);
        }
        let root_wrap = keyring.root_wrap_key.clone();
        for record in &root_records {
            verify_record(&keyring, record)?;
            let material = open_record(record, &root_wrap)
                .map_err(|_| BarrierError::InvalidShare)?;
            if record.is_current() {
                keyring.current_root = record.id.clone();
            }
            keyring.keys.insert(
                record.id.clone(),
                TierKey {
                    tier: KeyTier::Root,
                    material,
                },
            );
        }
        if keyring.current_root.is_empty() {
            return Err(BarrierError::KeyNotFound);
        }

        // Intermediates under their named parent root, contents under their
        // named parent intermediate.
        for tier in [KeyTier::Intermediate, KeyTier::Content] {
            let records = db::barrier_keys::list_tier(&self.pool, tier.as_str()).await?;
            for record in &records {
                verify_record(&keyring, record)?;
                let parent_id = record
                    .parent_key_id
                    .as_deref()
                    .ok_or(BarrierError::IntegrityFailed)?;
                let parent = keyring
                    .keys
                    .get(parent_id)
                    .ok_or(BarrierError::KeyNotFound)?;
                let material = open_record(record, &parent.material)
                    .map_err(|_| BarrierError::IntegrityFailed)?;
                if record.is_current() {
                    keyring.set_current(tier, record.id.clone());
                }
                keyring.keys.insert(
                    record.id.clone(),
                    TierKey {
                        tier,
                        material,
                    },
                );
            }
            if keyring.current_id(tier).is_empty() {
                return Err(BarrierError::KeyNotFound);
            }
        }

        let mut inner = self.inner.write().await;
        inner.keyring = Some(keyring);
        inner.state = BarrierState::Unsealed;
        tracing::info!("barrier unsealed");
        Ok(())
    }

    /// Zeroize all key material and return to Sealed.
    pub async fn seal(&self) {
        let mut inner = self.inner.write().await;
        inner.state = BarrierState::Sealing;
        inner.keyring = None; // Zeroizing drops wipe the material.
        inner.state = BarrierState::Sealed;
        drop(inner);
        self.progress.lock().await.clear();
        tracing::warn!("barrier sealed");
    }

    /// Envelope-encrypt under the current content key.
    pub async fn encrypt_content(&self, aad: &[u8], plaintext: &[u8]) -> Result<String, BarrierError> {
        let inner = self.inner.read().await;
        let keyring = keyring_of(&inner)?;
        let key_id = keyring.current_content.clone();
        let key = keyring.keys.get(&key_id).ok_or(BarrierError::KeyNotFound)?;
        envelope::seal(&key_id, &key.material, AeadAlgorithm::Aes256Gcm, aad, plaintext)
    }

    /// Decrypt an envelope with the content key named inside it, current or
    /// not.
    pub async fn decrypt_content(&self, aad: &[u8], sealed: &str) -> Result<Vec<u8>, BarrierError> {
        let key_id = envelope::key_id(sealed)?;
        let inner = self.inner.read().await;
        let keyring = keyring_of(&inner)?;
        let key = keyring.keys.get(&key_id).ok_or(BarrierError::KeyNotFound)?;
        if key.tier != KeyTier::Content {
            return Err(BarrierError::KeyNotFound);
        }
        envelope::open(sealed, &key.material, AeadAlgorithm::Aes256Gcm, aad)
    }

    /// Rotate a tier: mint a new current key sealed under the tier above,
    /// single-flight per tier. A caller that contends with an in-flight
    /// rotation waits on the tier lock and adopts that rotation's result
    /// instead of stacking another one. Prior keys stay loaded for decrypt.
    pub async fn rotate(&self, tier: KeyTier) -> Result<String, BarrierError> {
        // Snapshot the tier's current key before queueing on the lock.
        let before = {
            let inner = self.inner.read().await;
            let keyring = keyring_of(&inner)?;
            keyring.current_id(tier).to_string()
        };

        let _guard = match tier {
            KeyTier::Root => self.rotation_root.lock().await,
            KeyTier::Intermediate => self.rotation_intermediate.lock().await,
            KeyTier::Content => self.rotation_content.lock().await,
        };

        // The rotation that held the lock while we waited satisfies this
        // call.
        {
            let inner = self.inner.read().await;
            let keyring = keyring_of(&inner)?;
            let current = keyring.current_id(tier);
            if current != before {
                return Ok(current.to_string());
            }
        }

        let now = now_nanos();
        let new_key = new_tier_key(tier);

        // Seal under the parent tier's current key (root under the unseal
        // wrap key) using a snapshot taken under the read lock.
        let (record, material) = {
            let inner = self.inner.read().await;
            let keyring = keyring_of(&inner)?;
            let (parent_id, parent_key): (Option<String>, Zeroizing<Vec<u8>>) = match tier {
                KeyTier::Root => (None, keyring.root_wrap_key.clone()),
                KeyTier::Intermediate => {
                    let id = keyring.current_root.clone();
                    let key = keyring.keys.get(&id).ok_or(BarrierError::KeyNotFound)?;
                    (Some(id), key.material.clone())
                }
                KeyTier::Content => {
                    let id = keyring.current_intermediate.clone();
                    let key = keyring.keys.get(&id).ok_or(BarrierError::KeyNotFound)?;
                    (Some(id), key.material.clone())
                }
            };
            let record = seal_record(keyring, &new_key, parent_id.as_deref(), &parent_key, now)?;
            (record, new_key.1)
        };

        db::barrier_keys::rotate_record(&self.pool, &record, now).await?;

        let mut inner = self.inner.write().await;
        let keyring = inner.keyring.as_mut().ok_or(BarrierError::Sealed)?;
        keyring.keys.insert(
            record.id.clone(),
            TierKey {
                tier,
                material,
            },
        );
        keyring.set_current(tier, record.id.clone());
        tracing::info!(tier = tier.as_str(), key_id = %record.id, "barrier tier rotated");
        Ok(record.id)
    }

    /// Retire a non-current key: it stops decrypting immediately. The
    /// tier's current key is still in service and must be rotated out
    /// first; refusing that is the one fail-fast use of
    /// `RotationInProgress`.
    pub async fn retire(&self, key_id: &str) -> Result<(), BarrierError> {
        {
            let inner = self.inner.read().await;
            let keyring = keyring_of(&inner)?;
            if [
                keyring.current_root.as_str(),
                keyring.current_intermediate.as_str(),
                keyring.current_content.as_str(),
            ]
            .contains(&key_id)
            {
                return Err(BarrierError::RotationInProgress);
            }
            if !keyring.keys.contains_key(key_id) {
                return Err(BarrierError::KeyNotFound);
            }
        }

        db::barrier_keys::set_status(&self.pool, key_id, "retired", now_nanos()).await?;
        let mut inner = self.inner.write().await;
        if let Some(keyring) = inner.keyring.as_mut() {
            keyring.keys.remove(key_id);
        }
        Ok(())
    }

    /// Key ids currently loaded, for the admin key listing.
    pub async fn loaded_key_ids(&self) -> Result<Vec<(String, &'static str, bool)>, BarrierError> {
        let inner = self.inner.read().await;
        let keyring = keyring_of(&inner)?;
        let mut out: Vec<(String, &'static str, bool)> = keyring
            .keys
            .iter()
            .map(|(id, key)| {
                let current = keyring.current_id(key.tier) == id;
                (id.clone(), key.tier.as_str(), current)
            })
            .collect();
        out.sort();
        Ok(out)
    }
}

fn keyring_of<'a>(inner: &'a tokio::sync::RwLockReadGuard<'_, Inner>) -> Result<&'a Keyring, BarrierError> {
    if inner.state != BarrierState::Unsealed {
        return Err(BarrierError::Sealed);
    }
    inner.keyring.as_ref().ok_or(BarrierError::Sealed)
}

fn derive_keyring(unseal_key: &[u8]) -> Result<Keyring, BarrierError> {
    let integrity_key = Zeroizing::new(crypto_core::kdf::hkdf_derive(
        unseal_key,
        &[],
        b"keystone-barrier integrity",
        KEY_LEN,
    )?);
    let root_wrap_key = Zeroizing::new(crypto_core::kdf::hkdf_derive(
        unseal_key,
        &[],
        b"keystone-barrier root-wrap",
        KEY_LEN,
    )?);
    Ok(Keyring {
        integrity_key,
        root_wrap_key,
        keys: HashMap::new(),
        current_root: String::new(),
        current_intermediate: String::new(),
        current_content: String::new(),
    })
}

fn new_tier_key(tier: KeyTier) -> (KeyTier, Zeroizing<Vec<u8>>) {
    (tier, Zeroizing::new(crypto_core::random_bytes(KEY_LEN)))
}

/// Seal a tier key under its parent and produce the persistable record,
/// HMAC included.
fn seal_record(
    keyring: &Keyring,
    key: &(KeyTier, Zeroizing<Vec<u8>>),
    parent_id: Option<&str>,
    parent_key: &[u8],
    now: i64,
) -> Result<BarrierKeyRecord, BarrierError> {
    let id = Uuid::now_v7().to_string();
    let nonce = crypto_core::random_array::<{ crypto_core::aead::NONCE_LEN }>();
    let ciphertext = crypto_core::aead::aead_seal(
        AeadAlgorithm::Aes256Gcm,
        parent_key,
        &nonce,
        id.as_bytes(),
        &key.1,
    )?;
    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    let ciphertext_b64 = base64_url(&sealed);

    let hmac = record_hmac(&keyring.integrity_key, &id, key.0.as_str(), TIER_ALGORITHM, &ciphertext_b64)?;

    Ok(BarrierKeyRecord {
        id,
        tier: key.0.as_str().to_string(),
        algorithm: TIER_ALGORITHM.to_string(),
        ciphertext: ciphertext_b64,
        parent_key_id: parent_id.map(str::to_string),
        hmac,
        status: "current".to_string(),
        created_at: now,
        rotated_at: None,
    })
}

fn verify_record(keyring: &Keyring, record: &BarrierKeyRecord) -> Result<(), BarrierError> {
    let expected = record_hmac(
        &keyring.integrity_key,
        &record.id,
        &record.tier,
        &record.algorithm,
        &record.ciphertext,
    )?;
    if !crypto_core::constant_time_eq(expected.as_bytes(), record.hmac.as_bytes()) {
        tracing::error!(key_id = %record.id, tier = %record.tier, "barrier record integrity mismatch");
        return Err(BarrierError::IntegrityFailed);
    }
    if record.algorithm != TIER_ALGORITHM {
        return Err(BarrierError::AlgorithmUnsupported(record.algorithm.clone()));
    }
    Ok(())
}

fn open_record(
    record: &BarrierKeyRecord,
    parent_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, BarrierError> {
    let raw = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        &record.ciphertext,
    )
    .map_err(|_| BarrierError::IntegrityFailed)?;
    if raw.len() < crypto_core::aead::NONCE_LEN + 16 {
        return Err(BarrierError::IntegrityFailed);
    }
    let (nonce, ciphertext) = raw.split_at(crypto_core::aead::NONCE_LEN);
    let material = crypto_core::aead::aead_open(
        AeadAlgorithm::Aes256Gcm,
        parent_key,
        nonce,
        record.id.as_bytes(),
        ciphertext,
    )?;
    Ok(Zeroizing::new(material))
}

fn record_hmac(
    integrity_key: &[u8],
    id: &str,
    tier: &str,
    algorithm: &str,
    ciphertext: &str,
) -> Result<String, BarrierError> {
    let mut input = Vec::new();
    for part in [id, tier, algorithm, ciphertext] {
        input.extend_from_slice(part.as_bytes());
        input.push(0x1f);
    }
    let tag = crypto_core::digest::hmac_sign(DigestAlgorithm::Sha256, integrity_key, &input)?;
    Ok(hex::encode(tag))
}

fn base64_url(raw: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, raw)
}
