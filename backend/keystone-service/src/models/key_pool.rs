//! KMS elastic key pools and versioned material keys.

use serde::{Deserialize, Serialize};

use super::parse_json_list;

/// Algorithms a pool can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EcP256,
    EcP384,
    EcP521,
    Ed25519,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl PoolAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolAlgorithm::Aes128Gcm => "AES-128-GCM",
            PoolAlgorithm::Aes256Gcm => "AES-256-GCM",
            PoolAlgorithm::Rsa2048 => "RSA-2048",
            PoolAlgorithm::Rsa3072 => "RSA-3072",
            PoolAlgorithm::Rsa4096 => "RSA-4096",
            PoolAlgorithm::EcP256 => "EC-P256",
            PoolAlgorithm::EcP384 => "EC-P384",
            PoolAlgorithm::EcP521 => "EC-P521",
            PoolAlgorithm::Ed25519 => "Ed25519",
            PoolAlgorithm::HmacSha256 => "HMAC-SHA-256",
            PoolAlgorithm::HmacSha384 => "HMAC-SHA-384",
            PoolAlgorithm::HmacSha512 => "HMAC-SHA-512",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AES-128-GCM" => Some(PoolAlgorithm::Aes128Gcm),
            "AES-256-GCM" => Some(PoolAlgorithm::Aes256Gcm),
            "RSA-2048" => Some(PoolAlgorithm::Rsa2048),
            "RSA-3072" => Some(PoolAlgorithm::Rsa3072),
            "RSA-4096" => Some(PoolAlgorithm::Rsa4096),
            "EC-P256" => Some(PoolAlgorithm::EcP256),
            "EC-P384" => Some(PoolAlgorithm::EcP384),
            "EC-P521" => Some(PoolAlgorithm::EcP521),
            "Ed25519" => Some(PoolAlgorithm::Ed25519),
            "HMAC-SHA-256" => Some(PoolAlgorithm::HmacSha256),
            "HMAC-SHA-384" => Some(PoolAlgorithm::HmacSha384),
            "HMAC-SHA-512" => Some(PoolAlgorithm::HmacSha512),
            _ => None,
        }
    }

    /// Operations the algorithm is capable of.
    pub fn capabilities(&self) -> &'static [KeyPoolOp] {
        match self {
            PoolAlgorithm::Aes128Gcm | PoolAlgorithm::Aes256Gcm => {
                &[KeyPoolOp::Encrypt, KeyPoolOp::Decrypt]
            }
            PoolAlgorithm::Rsa2048
            | PoolAlgorithm::Rsa3072
            | PoolAlgorithm::Rsa4096
            | PoolAlgorithm::EcP256
            | PoolAlgorithm::EcP384
            | PoolAlgorithm::EcP521
            | PoolAlgorithm::Ed25519 => &[KeyPoolOp::Sign, KeyPoolOp::Verify],
            PoolAlgorithm::HmacSha256 | PoolAlgorithm::HmacSha384 | PoolAlgorithm::HmacSha512 => {
                &[KeyPoolOp::Sign, KeyPoolOp::Verify]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPoolOp {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Rotate,
    Retire,
}

impl KeyPoolOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPoolOp::Encrypt => "encrypt",
            KeyPoolOp::Decrypt => "decrypt",
            KeyPoolOp::Sign => "sign",
            KeyPoolOp::Verify => "verify",
            KeyPoolOp::Rotate => "rotate",
            KeyPoolOp::Retire => "retire",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "encrypt" => Some(KeyPoolOp::Encrypt),
            "decrypt" => Some(KeyPoolOp::Decrypt),
            "sign" => Some(KeyPoolOp::Sign),
            "verify" => Some(KeyPoolOp::Verify),
            "rotate" => Some(KeyPoolOp::Rotate),
            "retire" => Some(KeyPoolOp::Retire),
            _ => None,
        }
    }

    /// Scope required on the caller's access token.
    pub fn required_scope(&self) -> &'static str {
        match self {
            KeyPoolOp::Encrypt => "kms:encrypt",
            KeyPoolOp::Decrypt => "kms:decrypt",
            KeyPoolOp::Sign => "kms:sign",
            KeyPoolOp::Verify => "kms:verify",
            KeyPoolOp::Rotate => "kms:rotate",
            KeyPoolOp::Retire => "kms:retire",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyPool {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub algorithm: String,
    /// JSON array of permitted operation names.
    pub allowed_ops: String,
    /// `decrypt_only` keeps retired versions usable for decrypt/verify;
    /// `inert` disables them entirely.
    pub rotation_policy: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KeyPool {
    pub fn algorithm_(&self) -> Option<PoolAlgorithm> {
        PoolAlgorithm::parse(&self.algorithm)
    }

    pub fn allows_op(&self, op: KeyPoolOp) -> bool {
        parse_json_list(&self.allowed_ops)
            .iter()
            .filter_map(|o| KeyPoolOp::parse(o))
            .any(|o| o == op)
    }

    pub fn retire_to_inert(&self) -> bool {
        self.rotation_policy == "inert"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKeyStatus {
    Current,
    Superseded,
    Retired,
    Inert,
}

impl MaterialKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialKeyStatus::Current => "current",
            MaterialKeyStatus::Superseded => "superseded",
            MaterialKeyStatus::Retired => "retired",
            MaterialKeyStatus::Inert => "inert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current" => Some(MaterialKeyStatus::Current),
            "superseded" => Some(MaterialKeyStatus::Superseded),
            "retired" => Some(MaterialKeyStatus::Retired),
            "inert" => Some(MaterialKeyStatus::Inert),
            _ => None,
        }
    }
}

/// One version of a pool's key material. Material is stored as a barrier
/// envelope and never crosses the API.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MaterialKey {
    pub id: String,
    pub pool_id: String,
    pub version: i64,
    pub algorithm: String,
    /// Barrier content-tier envelope of the raw key bytes or PKCS#8 PEM.
    pub material_enc: String,
    /// SPKI PEM for asymmetric algorithms.
    pub public_key_pem: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub retired_at: Option<i64>,
}

impl MaterialKey {
    pub fn status_(&self) -> Option<MaterialKeyStatus> {
        MaterialKeyStatus::parse(&self.status)
    }

    /// Superseded versions stay usable for decrypt/verify; retired ones only
    /// under a `decrypt_only` policy; inert never.
    pub fn usable_for_read(&self) -> bool {
        matches!(
            self.status_(),
            Some(MaterialKeyStatus::Current)
                | Some(MaterialKeyStatus::Superseded)
                | Some(MaterialKeyStatus::Retired)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::to_json_list;

    #[test]
    fn test_pool_algorithm_round_trip() {
        for alg in [
            "AES-128-GCM",
            "AES-256-GCM",
            "RSA-2048",
            "EC-P256",
            "Ed25519",
            "HMAC-SHA-512",
        ] {
            assert_eq!(PoolAlgorithm::parse(alg).unwrap().as_str(), alg);
        }
    }

    #[test]
    fn test_pool_op_gating() {
        let pool = KeyPool {
            id: "p1".into(),
            tenant_id: "t1".into(),
            name: "payments".into(),
            algorithm: "AES-256-GCM".into(),
            allowed_ops: to_json_list(&["encrypt".to_string(), "decrypt".to_string()]),
            rotation_policy: "decrypt_only".into(),
            created_at: 0,
            updated_at: 0,
        };
        assert!(pool.allows_op(KeyPoolOp::Encrypt));
        assert!(!pool.allows_op(KeyPoolOp::Sign));
        assert!(!pool.retire_to_inert());
    }

    #[test]
    fn test_material_read_usability() {
        let mut key = MaterialKey {
            id: "m1".into(),
            pool_id: "p1".into(),
            version: 1,
            algorithm: "AES-256-GCM".into(),
            material_enc: "env".into(),
            public_key_pem: None,
            status: "superseded".into(),
            created_at: 0,
            retired_at: None,
        };
        assert!(key.usable_for_read());
        key.status = "inert".into();
        assert!(!key.usable_for_read());
    }
}
