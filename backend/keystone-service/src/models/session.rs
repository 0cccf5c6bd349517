//! Server-side session model. The id is the opaque cookie value; it never
//! appears in logs or tokens.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    /// Opaque 256-bit random id, base64url.
    pub id: String,
    pub user_id: String,
    pub created_at: i64,
    pub last_seen_at: i64,
    /// Absolute expiration; idle timeout is enforced separately from
    /// `last_seen_at`.
    pub expires_at: i64,
    pub active: bool,
    /// 256-bit CSRF token bound to this session.
    pub csrf_token: String,
}

impl Session {
    pub fn is_absolute_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn is_idle_expired(&self, now: i64, idle_timeout_nanos: i64) -> bool {
        now > self.last_seen_at.saturating_add(idle_timeout_nanos)
    }

    pub fn is_usable(&self, now: i64, idle_timeout_nanos: i64) -> bool {
        self.active && !self.is_absolute_expired(now) && !self.is_idle_expired(now, idle_timeout_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session {
            id: "sid".into(),
            user_id: "u1".into(),
            created_at: 0,
            last_seen_at: 1_000,
            expires_at: 10_000,
            active: true,
            csrf_token: "csrf".into(),
        }
    }

    #[test]
    fn test_idle_and_absolute_timeouts_are_independent() {
        let session = sample();
        // Within both limits.
        assert!(session.is_usable(1_500, 1_000));
        // Idle expired, absolute fine.
        assert!(!session.is_usable(2_500, 1_000));
        // Absolute expired even though recently touched.
        let mut recent = sample();
        recent.last_seen_at = 9_999;
        assert!(!recent.is_usable(10_001, 1_000_000));
    }

    #[test]
    fn test_inactive_session_unusable() {
        let mut session = sample();
        session.active = false;
        assert!(!session.is_usable(1_001, 10_000));
    }
}
