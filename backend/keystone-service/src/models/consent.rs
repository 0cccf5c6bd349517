//! Consent decision model.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConsentDecision {
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    /// Canonical scope: sorted, deduplicated, space-joined.
    pub scope: String,
    pub granted_at: i64,
    pub expires_at: i64,
}

impl ConsentDecision {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// True when this consent covers every token of `requested` scope.
    pub fn covers(&self, requested: &str) -> bool {
        let granted: Vec<&str> = self.scope.split_whitespace().collect();
        requested
            .split_whitespace()
            .all(|s| granted.contains(&s))
    }
}
