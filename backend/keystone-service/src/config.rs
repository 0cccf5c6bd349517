//! Configuration management for the Keystone service.
//!
//! Settings load from, in increasing precedence:
//! 1. Built-in defaults
//! 2. A YAML file (`--config`)
//! 3. Environment variables (`KEYSTONE__SECTION__KEY`)
//! 4. `--override key=value` CLI flags
//!
//! Secrets prefer file indirection (`admin.token_file`) over inline values.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub issuer: String,
    pub database: DatabaseSettings,
    pub public_listener: PublicListenerSettings,
    pub admin_listener: AdminListenerSettings,
    pub session: SessionSettings,
    pub oauth: OAuthSettings,
    pub signing: SigningSettings,
    pub unseal: UnsealSettings,
    pub request: RequestSettings,
    pub limits: RateLimitSettings,
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Load settings from file, environment, and explicit overrides.
    pub fn load(config_path: Option<&Path>, overrides: &[String]) -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
        }

        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("KEYSTONE")
                .separator("__")
                .try_parsing(true),
        );

        for entry in overrides {
            let (key, value) = entry
                .split_once('=')
                .with_context(|| format!("override `{entry}` is not key=value"))?;
            builder = builder
                .set_override(key, value)
                .with_context(|| format!("invalid override key `{key}`"))?;
        }

        let mut settings: Settings = builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        settings.resolve_secret_files()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Pull secrets referenced by `*_file` keys into memory.
    fn resolve_secret_files(&mut self) -> Result<()> {
        if let Some(path) = &self.admin_listener.token_file {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read admin token file {path}"))?;
            self.admin_listener.token = Some(token.trim().to_string());
        }
        if let Some(path) = &self.database.password_file {
            let password = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read database password file {path}"))?;
            self.database.url = self
                .database
                .url
                .replace("{password}", password.trim());
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            bail!("database.url must be set");
        }
        if self.issuer.is_empty() {
            bail!("issuer must be set");
        }
        url::Url::parse(&self.issuer).context("issuer must be an absolute URL")?;

        let admin_host = self.admin_listener.host.as_str();
        if !(admin_host == "localhost"
            || admin_host
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false))
        {
            bail!("admin_listener.host must be a loopback address, got `{admin_host}`");
        }

        if self.unseal.threshold == 0 || self.unseal.shares == 0 {
            bail!("unseal.shares and unseal.threshold must be at least 1");
        }
        if self.unseal.threshold > self.unseal.shares {
            bail!(
                "unseal.threshold ({}) cannot exceed unseal.shares ({})",
                self.unseal.threshold,
                self.unseal.shares
            );
        }

        jose_core::SignatureAlgorithm::parse(&self.signing.algorithm)
            .map_err(|_| anyhow::anyhow!("signing.algorithm `{}` is not recognized", self.signing.algorithm))?;

        Ok(())
    }

    pub fn public_addr(&self) -> String {
        format!("{}:{}", self.public_listener.host, self.public_listener.port)
    }

    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.admin_listener.host, self.admin_listener.port)
    }

    pub fn token_endpoint_url(&self) -> String {
        format!("{}/oauth2/v1/token", self.issuer.trim_end_matches('/'))
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub password_file: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            password_file: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
        }
    }
}

impl DatabaseSettings {
    pub fn pool_config(&self) -> db_pool::DbConfig {
        db_pool::DbConfig {
            database_url: self.url.clone(),
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            acquire_timeout_secs: self.acquire_timeout_secs,
            idle_timeout_secs: self.idle_timeout_secs,
        }
    }
}

/// Public listener (routable interface, `/service` + `/browser`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicListenerSettings {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsSettings>,
}

impl Default for PublicListenerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            tls: None,
        }
    }
}

/// TLS material for a listener. When absent the listener speaks plain TCP
/// (deployments with LB-terminated TLS).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_file: String,
    pub key_file: String,
    /// Ask connecting clients for a certificate (enables mTLS client auth).
    pub request_client_cert: bool,
    /// Trust anchors for presented client certificates.
    pub client_ca_file: Option<String>,
}

/// Admin listener (loopback only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminListenerSettings {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub token_file: Option<String>,
}

impl Default for AdminListenerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9443,
            token: None,
            token_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub idle_timeout_secs: i64,
    pub absolute_timeout_secs: i64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_limit: i64,
    /// Marks cookies `Secure`; disable only for local plain-HTTP development.
    pub secure_cookies: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            absolute_timeout_secs: 12 * 60 * 60,
            sweep_interval_secs: 60,
            sweep_batch_limit: 500,
            secure_cookies: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub code_ttl_secs: i64,
    pub consent_ttl_secs: i64,
    pub clock_skew_secs: u64,
    pub default_access_token_ttl_secs: i64,
    pub default_refresh_token_ttl_secs: i64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            code_ttl_secs: 5 * 60,
            consent_ttl_secs: 30 * 24 * 60 * 60,
            clock_skew_secs: 60,
            default_access_token_ttl_secs: 3600,
            default_refresh_token_ttl_secs: 30 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    /// JWS algorithm for newly created signing keys.
    pub algorithm: String,
    pub rotation_interval_secs: u64,
    /// How long a rotated-out key stays verify-only before retiring. Must
    /// cover the longest token lifetime issued under it.
    pub retire_after_secs: i64,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            algorithm: "ES256".to_string(),
            rotation_interval_secs: 24 * 60 * 60,
            retire_after_secs: 31 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsealSettings {
    pub shares: u8,
    pub threshold: u8,
    /// Abort startup (exit code 2) when unseal does not complete in time.
    pub timeout_secs: Option<u64>,
}

impl Default for UnsealSettings {
    fn default() -> Self {
        Self {
            shares: 5,
            threshold: 3,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub deadline_secs: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self { deadline_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub service_per_second: u32,
    pub browser_per_second: u32,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            service_per_second: 50,
            browser_per_second: 10,
            burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub json_logs: bool,
    pub buffer_size: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            json_logs: false,
            buffer_size: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn base_overrides() -> Vec<String> {
        vec![
            "database.url=sqlite::memory:".to_string(),
            "issuer=https://idp.test".to_string(),
        ]
    }

    #[test]
    #[serial]
    fn test_defaults_with_overrides() {
        let settings = Settings::load(None, &base_overrides()).unwrap();
        assert_eq!(settings.oauth.code_ttl_secs, 300);
        assert_eq!(settings.oauth.consent_ttl_secs, 30 * 24 * 60 * 60);
        assert_eq!(settings.unseal.shares, 5);
        assert_eq!(settings.unseal.threshold, 3);
        assert_eq!(settings.request.deadline_secs, 30);
        assert_eq!(settings.signing.algorithm, "ES256");
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("KEYSTONE__SESSION__IDLE_TIMEOUT_SECS", "120");
        let settings = Settings::load(None, &base_overrides()).unwrap();
        assert_eq!(settings.session.idle_timeout_secs, 120);
        std::env::remove_var("KEYSTONE__SESSION__IDLE_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_admin_listener_must_be_loopback() {
        let mut overrides = base_overrides();
        overrides.push("admin_listener.host=0.0.0.0".to_string());
        assert!(Settings::load(None, &overrides).is_err());
    }

    #[test]
    #[serial]
    fn test_threshold_cannot_exceed_shares() {
        let mut overrides = base_overrides();
        overrides.push("unseal.threshold=6".to_string());
        assert!(Settings::load(None, &overrides).is_err());
    }

    #[test]
    #[serial]
    fn test_missing_database_url_rejected() {
        let overrides = vec!["issuer=https://idp.test".to_string()];
        assert!(Settings::load(None, &overrides).is_err());
    }

    #[test]
    #[serial]
    fn test_token_endpoint_url() {
        let settings = Settings::load(None, &base_overrides()).unwrap();
        assert_eq!(settings.token_endpoint_url(), "https://idp.test/oauth2/v1/token");
    }
}
