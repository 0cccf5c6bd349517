//! KMS service layer: tenant-scoped elastic key pools over the barrier.
//!
//! Material keys live only as barrier envelopes; callers see ciphertexts
//! and key handles, never key bytes. Every operation checks the caller's
//! token scope and that the pool belongs to the caller's tenant.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use uuid::Uuid;

use crypto_core::aead::AeadAlgorithm;
use crypto_core::asym::SignatureScheme;
use crypto_core::digest::DigestAlgorithm;

use crate::barrier::envelope;
use crate::clock::now_nanos;
use crate::db;
use crate::error::{Result, ServiceError};
use crate::models::{KeyPool, KeyPoolOp, MaterialKey, PoolAlgorithm, to_json_list};
use crate::AppState;

/// Scope required for pool administration (create, generate).
pub const ADMIN_SCOPE: &str = "kms:admin";

/// Authenticated caller facts extracted from the access token.
#[derive(Debug, Clone)]
pub struct KmsCaller {
    pub tenant_id: String,
    pub scopes: Vec<String>,
}

impl KmsCaller {
    fn require_scope(&self, scope: &str) -> Result<()> {
        if self.scopes.iter().any(|s| s == scope) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden)
        }
    }

    fn require_op(&self, pool: &KeyPool, op: KeyPoolOp) -> Result<()> {
        self.require_scope(op.required_scope())?;
        if pool.tenant_id != self.tenant_id {
            // Cross-tenant pools are indistinguishable from absent ones.
            return Err(ServiceError::NotFound);
        }
        if !pool.allows_op(op) {
            return Err(ServiceError::Forbidden);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignatureOut {
    pub key_id: String,
    pub version: i64,
    pub signature: String,
}

/// Create a pool with an initial current material version.
pub async fn create_pool(
    state: &AppState,
    caller: &KmsCaller,
    name: &str,
    algorithm: &str,
    allowed_ops: &[String],
    rotation_policy: &str,
) -> Result<KeyPool> {
    caller.require_scope(ADMIN_SCOPE)?;

    let algorithm = PoolAlgorithm::parse(algorithm)
        .ok_or_else(|| ServiceError::InvalidRequest(format!("unknown algorithm: {algorithm}")))?;
    if algorithm == PoolAlgorithm::EcP521 {
        return Err(ServiceError::InvalidRequest("EC-P521 is not supported".into()));
    }
    if !matches!(rotation_policy, "decrypt_only" | "inert") {
        return Err(ServiceError::InvalidRequest(
            "rotation_policy must be decrypt_only or inert".into(),
        ));
    }
    let capabilities = algorithm.capabilities();
    for op in allowed_ops {
        let parsed = KeyPoolOp::parse(op)
            .ok_or_else(|| ServiceError::InvalidRequest(format!("unknown op: {op}")))?;
        if matches!(
            parsed,
            KeyPoolOp::Encrypt | KeyPoolOp::Decrypt | KeyPoolOp::Sign | KeyPoolOp::Verify
        ) && !capabilities.contains(&parsed)
        {
            return Err(ServiceError::InvalidRequest(format!(
                "op {op} not supported by {}",
                algorithm.as_str()
            )));
        }
    }

    let now = now_nanos();
    let pool = KeyPool {
        id: Uuid::now_v7().to_string(),
        tenant_id: caller.tenant_id.clone(),
        name: name.to_string(),
        algorithm: algorithm.as_str().to_string(),
        allowed_ops: to_json_list(allowed_ops),
        rotation_policy: rotation_policy.to_string(),
        created_at: now,
        updated_at: now,
    };
    db::key_pools::insert_pool(&state.pool, &pool).await?;

    let material = mint_material(state, &pool, 1).await?;
    db::key_pools::insert_material(&state.pool, &material).await?;
    tracing::info!(pool = %pool.name, algorithm = %pool.algorithm, "key pool created");
    Ok(pool)
}

pub async fn list_pools(state: &AppState, caller: &KmsCaller) -> Result<Vec<KeyPool>> {
    caller.require_scope(ADMIN_SCOPE)?;
    Ok(db::key_pools::list_pools(&state.pool, &caller.tenant_id).await?)
}

/// Generate a new material version; it becomes current, the previous stays
/// usable for decrypt/verify.
pub async fn generate_material(
    state: &AppState,
    caller: &KmsCaller,
    pool_name: &str,
) -> Result<MaterialKey> {
    caller.require_scope(ADMIN_SCOPE)?;
    let pool = get_tenant_pool(state, caller, pool_name).await?;
    rotate_pool_material(state, &pool).await
}

/// `rotate` endpoint: same mechanics, gated by the rotate op.
pub async fn rotate(state: &AppState, caller: &KmsCaller, pool_name: &str) -> Result<MaterialKey> {
    let pool = get_tenant_pool(state, caller, pool_name).await?;
    caller.require_op(&pool, KeyPoolOp::Rotate)?;
    rotate_pool_material(state, &pool).await
}

/// Retire a superseded version: decrypt/verify-only or fully inert,
/// depending on the pool's policy.
pub async fn retire(
    state: &AppState,
    caller: &KmsCaller,
    pool_name: &str,
    version: i64,
) -> Result<()> {
    let pool = get_tenant_pool(state, caller, pool_name).await?;
    caller.require_op(&pool, KeyPoolOp::Retire)?;

    let status = if pool.retire_to_inert() { "inert" } else { "retired" };
    db::key_pools::set_material_status(&state.pool, &pool.id, version, status, now_nanos())
        .await
        .map_err(|err| match err {
            db::DbError::NotFound => {
                ServiceError::InvalidRequest("version not found or still current".into())
            }
            other => other.into(),
        })
}

/// Encrypt under the pool's current key. The returned ciphertext names the
/// key version that sealed it.
pub async fn encrypt(
    state: &AppState,
    caller: &KmsCaller,
    pool_name: &str,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<String> {
    let pool = get_tenant_pool(state, caller, pool_name).await?;
    caller.require_op(&pool, KeyPoolOp::Encrypt)?;

    let aead = aead_algorithm(&pool)?;
    let material = db::key_pools::current_material(&state.pool, &pool.id).await?;
    let key = unseal_material(state, &material).await?;
    let ciphertext = envelope::seal(&material.id, &key, aead, aad, plaintext)?;
    state.telemetry.record_metric("kms.encrypt", 1.0);
    Ok(ciphertext)
}

/// Decrypt with the key named inside the ciphertext, current or not.
pub async fn decrypt(
    state: &AppState,
    caller: &KmsCaller,
    aad: &[u8],
    ciphertext: &str,
) -> Result<Vec<u8>> {
    let key_id = envelope::key_id(ciphertext)?;
    let material = match db::key_pools::get_material(&state.pool, &key_id).await {
        Ok(material) => material,
        Err(db::DbError::NotFound) => return Err(ServiceError::KeyNotFound),
        Err(err) => return Err(err.into()),
    };
    let pool = db::key_pools::get_pool_by_id(&state.pool, &material.pool_id).await?;
    caller.require_op(&pool, KeyPoolOp::Decrypt)?;
    if !material.usable_for_read() {
        return Err(ServiceError::KeyNotFound);
    }

    let aead = aead_algorithm(&pool)?;
    let key = unseal_material(state, &material).await?;
    let plaintext = envelope::open(ciphertext, &key, aead, aad)?;
    state.telemetry.record_metric("kms.decrypt", 1.0);
    Ok(plaintext)
}

/// Sign with the pool's current key. The signature blob names the key
/// version, mirroring the ciphertext header.
pub async fn sign(
    state: &AppState,
    caller: &KmsCaller,
    pool_name: &str,
    message: &[u8],
) -> Result<SignatureOut> {
    let pool = get_tenant_pool(state, caller, pool_name).await?;
    caller.require_op(&pool, KeyPoolOp::Sign)?;

    let material = db::key_pools::current_material(&state.pool, &pool.id).await?;
    let raw = match signature_backend(&pool)? {
        SignatureBackend::Asymmetric(scheme) => {
            let key = unseal_material(state, &material).await?;
            let pem = String::from_utf8(key)
                .map_err(|_| ServiceError::Internal("material is not PEM".into()))?;
            crypto_core::asym::sign(scheme, &pem, message)?
        }
        SignatureBackend::Hmac(alg) => {
            let key = unseal_material(state, &material).await?;
            crypto_core::digest::hmac_sign(alg, &key, message)?
        }
    };

    state.telemetry.record_metric("kms.sign", 1.0);
    Ok(SignatureOut {
        key_id: material.id.clone(),
        version: material.version,
        signature: encode_signature(&material.id, &raw)?,
    })
}

/// Verify against the version named in the signature blob; any non-retired
/// version verifies.
pub async fn verify(
    state: &AppState,
    caller: &KmsCaller,
    message: &[u8],
    signature: &str,
) -> Result<bool> {
    let (key_id, raw) = decode_signature(signature)?;
    let material = match db::key_pools::get_material(&state.pool, &key_id).await {
        Ok(material) => material,
        Err(db::DbError::NotFound) => return Err(ServiceError::KeyNotFound),
        Err(err) => return Err(err.into()),
    };
    let pool = db::key_pools::get_pool_by_id(&state.pool, &material.pool_id).await?;
    caller.require_op(&pool, KeyPoolOp::Verify)?;
    if !material.usable_for_read() {
        return Err(ServiceError::KeyNotFound);
    }

    let ok = match signature_backend(&pool)? {
        SignatureBackend::Asymmetric(scheme) => {
            let public_pem = material
                .public_key_pem
                .as_deref()
                .ok_or(ServiceError::KeyNotFound)?;
            crypto_core::asym::verify(scheme, public_pem, message, &raw).is_ok()
        }
        SignatureBackend::Hmac(alg) => {
            let key = unseal_material(state, &material).await?;
            crypto_core::digest::hmac_verify(alg, &key, message, &raw).is_ok()
        }
    };
    state.telemetry.record_metric("kms.verify", 1.0);
    Ok(ok)
}

async fn get_tenant_pool(
    state: &AppState,
    caller: &KmsCaller,
    pool_name: &str,
) -> Result<KeyPool> {
    match db::key_pools::get_pool(&state.pool, &caller.tenant_id, pool_name).await {
        Ok(pool) => Ok(pool),
        Err(db::DbError::NotFound) => Err(ServiceError::NotFound),
        Err(err) => Err(err.into()),
    }
}

async fn rotate_pool_material(state: &AppState, pool: &KeyPool) -> Result<MaterialKey> {
    let version = db::key_pools::next_version(&state.pool, &pool.id).await?;
    let material = mint_material(state, pool, version).await?;
    db::with_retry(|| db::key_pools::rotate_material(&state.pool, &material)).await?;
    state.telemetry.record_metric("kms.rotate", 1.0);
    tracing::info!(pool = %pool.name, version, "key pool rotated");
    Ok(material)
}

/// Generate and seal fresh material for a pool version.
async fn mint_material(state: &AppState, pool: &KeyPool, version: i64) -> Result<MaterialKey> {
    let algorithm = pool
        .algorithm_()
        .ok_or_else(|| ServiceError::Internal("pool carries unknown algorithm".into()))?;
    let id = Uuid::now_v7().to_string();

    let (raw, public_key_pem): (Vec<u8>, Option<String>) = match algorithm {
        PoolAlgorithm::Aes128Gcm => (crypto_core::random_bytes(16), None),
        PoolAlgorithm::Aes256Gcm => (crypto_core::random_bytes(32), None),
        PoolAlgorithm::HmacSha256 => (crypto_core::random_bytes(32), None),
        PoolAlgorithm::HmacSha384 => (crypto_core::random_bytes(48), None),
        PoolAlgorithm::HmacSha512 => (crypto_core::random_bytes(64), None),
        PoolAlgorithm::EcP521 => {
            return Err(ServiceError::InvalidRequest("EC-P521 is not supported".into()))
        }
        asym => {
            let key_algorithm = match asym {
                PoolAlgorithm::Rsa2048 => crypto_core::asym::KeyAlgorithm::Rsa2048,
                PoolAlgorithm::Rsa3072 => crypto_core::asym::KeyAlgorithm::Rsa3072,
                PoolAlgorithm::Rsa4096 => crypto_core::asym::KeyAlgorithm::Rsa4096,
                PoolAlgorithm::EcP256 => crypto_core::asym::KeyAlgorithm::EcP256,
                PoolAlgorithm::EcP384 => crypto_core::asym::KeyAlgorithm::EcP384,
                PoolAlgorithm::Ed25519 => crypto_core::asym::KeyAlgorithm::Ed25519,
                _ => unreachable!("non-asymmetric algorithms handled above"),
            };
            let keypair = tokio::task::spawn_blocking(move || {
                crypto_core::asym::generate_keypair(key_algorithm)
            })
            .await
            .map_err(|_| ServiceError::Internal("keygen task failed".into()))??;
            (
                keypair.private_key_pem.as_bytes().to_vec(),
                Some(keypair.public_key_pem.clone()),
            )
        }
    };

    let material_enc = state.barrier.encrypt_content(id.as_bytes(), &raw).await?;

    Ok(MaterialKey {
        id,
        pool_id: pool.id.clone(),
        version,
        algorithm: pool.algorithm.clone(),
        material_enc,
        public_key_pem,
        status: "current".to_string(),
        created_at: now_nanos(),
        retired_at: None,
    })
}

async fn unseal_material(state: &AppState, material: &MaterialKey) -> Result<Vec<u8>> {
    state
        .barrier
        .decrypt_content(material.id.as_bytes(), &material.material_enc)
        .await
        .map_err(Into::into)
}

fn aead_algorithm(pool: &KeyPool) -> Result<AeadAlgorithm> {
    match pool.algorithm_() {
        Some(PoolAlgorithm::Aes128Gcm) => Ok(AeadAlgorithm::Aes128Gcm),
        Some(PoolAlgorithm::Aes256Gcm) => Ok(AeadAlgorithm::Aes256Gcm),
        _ => Err(ServiceError::InvalidRequest(
            "pool algorithm does not encrypt".into(),
        )),
    }
}

enum SignatureBackend {
    Asymmetric(SignatureScheme),
    Hmac(DigestAlgorithm),
}

fn signature_backend(pool: &KeyPool) -> Result<SignatureBackend> {
    match pool.algorithm_() {
        Some(PoolAlgorithm::Rsa2048) | Some(PoolAlgorithm::Rsa3072)
        | Some(PoolAlgorithm::Rsa4096) => {
            Ok(SignatureBackend::Asymmetric(SignatureScheme::RsaPkcs1Sha256))
        }
        Some(PoolAlgorithm::EcP256) => {
            Ok(SignatureBackend::Asymmetric(SignatureScheme::EcdsaP256Sha256))
        }
        Some(PoolAlgorithm::EcP384) => {
            Ok(SignatureBackend::Asymmetric(SignatureScheme::EcdsaP384Sha384))
        }
        Some(PoolAlgorithm::Ed25519) => {
            Ok(SignatureBackend::Asymmetric(SignatureScheme::Ed25519))
        }
        Some(PoolAlgorithm::HmacSha256) => Ok(SignatureBackend::Hmac(DigestAlgorithm::Sha256)),
        Some(PoolAlgorithm::HmacSha384) => Ok(SignatureBackend::Hmac(DigestAlgorithm::Sha384)),
        Some(PoolAlgorithm::HmacSha512) => Ok(SignatureBackend::Hmac(DigestAlgorithm::Sha512)),
        _ => Err(ServiceError::InvalidRequest(
            "pool algorithm does not sign".into(),
        )),
    }
}

/// Signature blob: `base64url( version ‖ key_id(16) ‖ raw signature )`.
fn encode_signature(key_id: &str, raw: &[u8]) -> Result<String> {
    let id = Uuid::parse_str(key_id).map_err(|_| ServiceError::KeyNotFound)?;
    let mut out = Vec::with_capacity(17 + raw.len());
    out.push(1u8);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(raw);
    Ok(URL_SAFE_NO_PAD.encode(out))
}

fn decode_signature(blob: &str) -> Result<(String, Vec<u8>)> {
    let raw = URL_SAFE_NO_PAD
        .decode(blob)
        .map_err(|_| ServiceError::InvalidRequest("malformed signature".into()))?;
    if raw.len() < 18 || raw[0] != 1 {
        return Err(ServiceError::InvalidRequest("malformed signature".into()));
    }
    let id = Uuid::from_slice(&raw[1..17])
        .map_err(|_| ServiceError::InvalidRequest("malformed signature".into()))?;
    Ok((id.to_string(), raw[17..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::token::tests::test_state;

    fn caller(tenant: &str) -> KmsCaller {
        KmsCaller {
            tenant_id: tenant.to_string(),
            scopes: vec![
                "kms:admin".into(),
                "kms:encrypt".into(),
                "kms:decrypt".into(),
                "kms:sign".into(),
                "kms:verify".into(),
                "kms:rotate".into(),
                "kms:retire".into(),
            ],
        }
    }

    fn crypt_ops() -> Vec<String> {
        ["encrypt", "decrypt", "rotate", "retire"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn sign_ops() -> Vec<String> {
        ["sign", "verify", "rotate", "retire"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_envelope_round_trip_across_rotation() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        create_pool(&state, &caller, "payments", "AES-256-GCM", &crypt_ops(), "decrypt_only")
            .await
            .unwrap();

        let ct = encrypt(&state, &caller, "payments", b"ctx", b"hello").await.unwrap();

        // Rotate: new current version; old ciphertext still decrypts and
        // new ciphertexts name a different key.
        rotate(&state, &caller, "payments").await.unwrap();
        assert_eq!(
            decrypt(&state, &caller, b"ctx", &ct).await.unwrap(),
            b"hello"
        );
        let ct2 = encrypt(&state, &caller, "payments", b"ctx", b"hello").await.unwrap();
        assert_ne!(
            envelope::key_id(&ct).unwrap(),
            envelope::key_id(&ct2).unwrap()
        );
    }

    #[tokio::test]
    async fn test_wrong_aad_fails() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        create_pool(&state, &caller, "p", "AES-256-GCM", &crypt_ops(), "decrypt_only")
            .await
            .unwrap();
        let ct = encrypt(&state, &caller, "p", b"ctx", b"data").await.unwrap();
        assert!(decrypt(&state, &caller, b"other", &ct).await.is_err());
    }

    #[tokio::test]
    async fn test_sign_verify_ed25519_across_rotation() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        create_pool(&state, &caller, "signer", "Ed25519", &sign_ops(), "decrypt_only")
            .await
            .unwrap();

        let sig = sign(&state, &caller, "signer", b"message").await.unwrap();
        assert_eq!(sig.version, 1);
        assert!(verify(&state, &caller, b"message", &sig.signature).await.unwrap());
        assert!(!verify(&state, &caller, b"other", &sig.signature).await.unwrap());

        rotate(&state, &caller, "signer").await.unwrap();
        // Old version still verifies after rotation.
        assert!(verify(&state, &caller, b"message", &sig.signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_hmac_pool_sign_verify() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        create_pool(&state, &caller, "mac", "HMAC-SHA-256", &sign_ops(), "decrypt_only")
            .await
            .unwrap();
        let sig = sign(&state, &caller, "mac", b"payload").await.unwrap();
        assert!(verify(&state, &caller, b"payload", &sig.signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let state = test_state().await;
        let owner = caller("tenant-1");
        let outsider = caller("tenant-2");
        create_pool(&state, &owner, "private", "AES-256-GCM", &crypt_ops(), "decrypt_only")
            .await
            .unwrap();

        let ct = encrypt(&state, &owner, "private", b"", b"data").await.unwrap();
        // Foreign tenant sees neither the pool nor its ciphertexts.
        assert!(matches!(
            encrypt(&state, &outsider, "private", b"", b"data").await.unwrap_err(),
            ServiceError::NotFound
        ));
        assert!(matches!(
            decrypt(&state, &outsider, b"", &ct).await.unwrap_err(),
            ServiceError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_scope_enforcement() {
        let state = test_state().await;
        let admin = caller("tenant-1");
        create_pool(&state, &admin, "locked", "AES-256-GCM", &crypt_ops(), "decrypt_only")
            .await
            .unwrap();

        let mut limited = caller("tenant-1");
        limited.scopes = vec!["kms:encrypt".into()];
        encrypt(&state, &limited, "locked", b"", b"x").await.unwrap();

        let ct = encrypt(&state, &admin, "locked", b"", b"x").await.unwrap();
        assert!(matches!(
            decrypt(&state, &limited, b"", &ct).await.unwrap_err(),
            ServiceError::Forbidden
        ));
    }

    #[tokio::test]
    async fn test_pool_op_allowlist() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        let encrypt_only: Vec<String> = vec!["encrypt".into(), "decrypt".into()];
        create_pool(&state, &caller, "enc", "AES-256-GCM", &encrypt_only, "decrypt_only")
            .await
            .unwrap();
        assert!(matches!(
            rotate(&state, &caller, "enc").await.unwrap_err(),
            ServiceError::Forbidden
        ));
    }

    #[tokio::test]
    async fn test_retire_policies() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        create_pool(&state, &caller, "soft", "AES-256-GCM", &crypt_ops(), "decrypt_only")
            .await
            .unwrap();
        create_pool(&state, &caller, "hard", "AES-256-GCM", &crypt_ops(), "inert")
            .await
            .unwrap();

        let soft_ct = encrypt(&state, &caller, "soft", b"", b"s").await.unwrap();
        let hard_ct = encrypt(&state, &caller, "hard", b"", b"h").await.unwrap();
        rotate(&state, &caller, "soft").await.unwrap();
        rotate(&state, &caller, "hard").await.unwrap();

        retire(&state, &caller, "soft", 1).await.unwrap();
        retire(&state, &caller, "hard", 1).await.unwrap();

        // decrypt_only policy keeps old ciphertexts readable; inert kills
        // them.
        assert_eq!(decrypt(&state, &caller, b"", &soft_ct).await.unwrap(), b"s");
        assert!(matches!(
            decrypt(&state, &caller, b"", &hard_ct).await.unwrap_err(),
            ServiceError::KeyNotFound
        ));
    }

    #[tokio::test]
    async fn test_current_version_cannot_retire() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        create_pool(&state, &caller, "p", "AES-256-GCM", &crypt_ops(), "decrypt_only")
            .await
            .unwrap();
        assert!(retire(&state, &caller, "p", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_p521_pool_rejected() {
        let state = test_state().await;
        let caller = caller("tenant-1");
        assert!(create_pool(&state, &caller, "p", "EC-P521", &sign_ops(), "decrypt_only")
            .await
            .is_err());
    }
}
