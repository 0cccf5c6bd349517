//! User account model.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    /// PBKDF2-HMAC-SHA256 record; never serialized outward.
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub email: String,
    pub email_verified: bool,
    /// JSON object of additional profile attributes.
    pub attributes: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    pub fn attribute_map(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(&self.attributes).unwrap_or_default()
    }

    /// Display name for the `profile` scope, falling back to the username.
    pub fn display_name(&self) -> String {
        self.attribute_map()
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.username.clone())
    }
}
