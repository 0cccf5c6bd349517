//! Persisted barrier key records.

/// Barrier tiers, top down. Reading a tier requires the tier above already
/// loaded in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTier {
    Root,
    Intermediate,
    Content,
}

impl KeyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyTier::Root => "root",
            KeyTier::Intermediate => "intermediate",
            KeyTier::Content => "content",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(KeyTier::Root),
            "intermediate" => Some(KeyTier::Intermediate),
            "content" => Some(KeyTier::Content),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BarrierKeyRecord {
    pub id: String,
    pub tier: String,
    pub algorithm: String,
    /// Key bytes sealed under the parent tier (root: under the unseal key),
    /// base64url `nonce ‖ ciphertext`.
    pub ciphertext: String,
    /// Parent key id; null for root records (the unseal key is never
    /// persisted).
    pub parent_key_id: Option<String>,
    /// HMAC-SHA-256 over `(id ‖ tier ‖ algorithm ‖ ciphertext)` under the
    /// integrity key; verified on every load.
    pub hmac: String,
    pub status: String,
    pub created_at: i64,
    pub rotated_at: Option<i64>,
}

impl BarrierKeyRecord {
    pub fn tier_(&self) -> Option<KeyTier> {
        KeyTier::parse(&self.tier)
    }

    pub fn is_current(&self) -> bool {
        self.status == "current"
    }
}
