//! Barrier-backed JWT signing keystore.
//!
//! The current key signs; rotated-out keys stay verify-only until every
//! token bound to them has expired, then retire. Private halves are
//! persisted only as barrier envelopes and decrypted into memory after
//! unseal. Reads vastly outnumber rotations, hence the reader-preferring
//! lock around the loaded set.

use sqlx::AnyPool;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use jose_core::{Jwk, JwkSet, SignatureAlgorithm};

use crate::barrier::Barrier;
use crate::clock::now_nanos;
use crate::db;
use crate::error::{Result, ServiceError};
use crate::models::SigningKey;

struct CurrentKey {
    kid: String,
    algorithm: SignatureAlgorithm,
    private_key_pem: Zeroizing<String>,
}

struct Loaded {
    current: CurrentKey,
    jwks: JwkSet,
}

pub struct SigningKeystore {
    pool: AnyPool,
    barrier: Arc<Barrier>,
    algorithm: SignatureAlgorithm,
    inner: RwLock<Option<Loaded>>,
}

impl SigningKeystore {
    pub fn new(pool: AnyPool, barrier: Arc<Barrier>, algorithm: SignatureAlgorithm) -> Self {
        Self {
            pool,
            barrier,
            algorithm,
            inner: RwLock::new(None),
        }
    }

    /// Load keys after unseal, creating the initial signing key on first
    /// start.
    pub async fn load(&self) -> Result<()> {
        if db::signing_keys::get_current(&self.pool).await?.is_none() {
            self.create_key().await?;
        }
        self.reload().await
    }

    /// Drop decrypted key material (on seal).
    pub async fn unload(&self) {
        *self.inner.write().await = None;
    }

    async fn reload(&self) -> Result<()> {
        let usable = db::signing_keys::list_usable(&self.pool).await?;
        let current_row = usable
            .iter()
            .find(|k| k.status == "current")
            .ok_or(ServiceError::KeyNotFound)?;

        let private_pem = self
            .barrier
            .decrypt_content(current_row.id.as_bytes(), &current_row.private_key_enc)
            .await?;
        let private_key_pem = Zeroizing::new(
            String::from_utf8(private_pem)
                .map_err(|_| ServiceError::Internal("signing key not UTF-8".into()))?,
        );

        let mut keys = Vec::with_capacity(usable.len());
        for row in &usable {
            let alg = SignatureAlgorithm::parse(&row.algorithm)?;
            keys.push(Jwk::from_public_key_pem(&row.id, alg, &row.public_key_pem)?);
        }

        let algorithm = SignatureAlgorithm::parse(&current_row.algorithm)?;
        *self.inner.write().await = Some(Loaded {
            current: CurrentKey {
                kid: current_row.id.clone(),
                algorithm,
                private_key_pem,
            },
            jwks: JwkSet { keys },
        });
        Ok(())
    }

    async fn create_key(&self) -> Result<()> {
        let key_algorithm = match self.algorithm {
            SignatureAlgorithm::RS256 | SignatureAlgorithm::RS384 | SignatureAlgorithm::RS512
            | SignatureAlgorithm::PS256 | SignatureAlgorithm::PS384 | SignatureAlgorithm::PS512 => {
                crypto_core::asym::KeyAlgorithm::Rsa2048
            }
            SignatureAlgorithm::ES256 => crypto_core::asym::KeyAlgorithm::EcP256,
            SignatureAlgorithm::ES384 => crypto_core::asym::KeyAlgorithm::EcP384,
            SignatureAlgorithm::EdDSA => crypto_core::asym::KeyAlgorithm::Ed25519,
            other => {
                return Err(ServiceError::ConfigInvalid(format!(
                    "signing algorithm {other} has no key backend"
                )))
            }
        };

        let algorithm = self.algorithm;
        let keypair = tokio::task::spawn_blocking(move || {
            crypto_core::asym::generate_keypair(key_algorithm)
        })
        .await
        .map_err(|_| ServiceError::Internal("keygen task failed".into()))??;

        let kid = Uuid::now_v7().to_string();
        let private_key_enc = self
            .barrier
            .encrypt_content(kid.as_bytes(), keypair.private_key_pem.as_bytes())
            .await?;

        let row = SigningKey {
            id: kid.clone(),
            algorithm: algorithm.as_str().to_string(),
            public_key_pem: keypair.public_key_pem.clone(),
            private_key_enc,
            status: "current".to_string(),
            created_at: now_nanos(),
            rotated_at: None,
            retired_at: None,
        };
        db::signing_keys::insert(&self.pool, &row).await?;
        tracing::info!(kid = %kid, algorithm = %algorithm, "created signing key");
        Ok(())
    }

    /// Demote the current key to verify-only and mint a successor.
    pub async fn rotate(&self) -> Result<String> {
        db::signing_keys::demote_current(&self.pool, now_nanos()).await?;
        self.create_key().await?;
        self.reload().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .as_ref()
            .map(|l| l.current.kid.clone())
            .unwrap_or_default())
    }

    /// Retire verify-only keys whose last bound token has expired. Retiring
    /// never makes a previously invalid token valid; it only stops
    /// verification of tokens that are all already expired.
    pub async fn retire_exhausted(&self, retire_after_nanos: i64) -> Result<usize> {
        let now = now_nanos();
        let usable = db::signing_keys::list_usable(&self.pool).await?;
        let mut retired = 0;
        for key in usable.iter().filter(|k| k.status == "verify_only") {
            let last_token_exp = db::tokens::max_expiry_for_signing_key(&self.pool, &key.id).await?;
            let horizon = match last_token_exp {
                Some(exp) => exp,
                None => key.rotated_at.unwrap_or(key.created_at) + retire_after_nanos,
            };
            if now > horizon {
                db::signing_keys::retire(&self.pool, &key.id, now).await?;
                retired += 1;
            }
        }
        if retired > 0 {
            self.reload().await?;
        }
        Ok(retired)
    }

    /// Signing material for token issuance.
    pub async fn current_signer(&self) -> Result<(String, SignatureAlgorithm, Zeroizing<String>)> {
        let inner = self.inner.read().await;
        let loaded = inner.as_ref().ok_or(ServiceError::Sealed)?;
        Ok((
            loaded.current.kid.clone(),
            loaded.current.algorithm,
            loaded.current.private_key_pem.clone(),
        ))
    }

    /// Public verification set (`/.well-known/jwks.json`).
    pub async fn jwks(&self) -> Result<JwkSet> {
        let inner = self.inner.read().await;
        let loaded = inner.as_ref().ok_or(ServiceError::Sealed)?;
        Ok(loaded.jwks.clone())
    }
}
