/// Credential hashing and verification with PBKDF2-HMAC-SHA256
///
/// Records are stored as `pbkdf2-sha256$<iterations>$<salt>$<hash>` with
/// base64url fields, a 32-byte random salt, and 600k iterations for new
/// records. Verification reads the iteration count from the record, so
/// older records keep verifying across parameter bumps.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{Result, ServiceError};

pub const PBKDF2_ITERATIONS: u32 = 600_000;
const SALT_LEN: usize = 32;
const HASH_LEN: usize = 32;
const SCHEME: &str = "pbkdf2-sha256";

/// Hash a password or client secret for storage.
pub fn hash_password(password: &str) -> Result<String> {
    hash_with_iterations(password, PBKDF2_ITERATIONS)
}

/// Hash with an explicit iteration count. Production paths use
/// [`hash_password`]; tests use small counts to stay fast.
pub fn hash_with_iterations(password: &str, iterations: u32) -> Result<String> {
    let salt = crypto_core::random_bytes(SALT_LEN);
    let hash = crypto_core::kdf::derive_pbkdf2(password.as_bytes(), &salt, iterations, HASH_LEN)
        .map_err(|e| ServiceError::Internal(format!("pbkdf2 failure: {e}")))?;

    Ok(format!(
        "{SCHEME}${iterations}${}${}",
        URL_SAFE_NO_PAD.encode(&salt),
        URL_SAFE_NO_PAD.encode(&hash),
    ))
}

/// Verify a password against a stored record in constant time.
///
/// Malformed records verify false rather than erroring; a typed error here
/// would leak which usernames have records at all.
pub fn verify_password(password: &str, record: &str) -> bool {
    let mut parts = record.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (
        URL_SAFE_NO_PAD.decode(salt),
        URL_SAFE_NO_PAD.decode(hash),
    ) else {
        return false;
    };

    let Ok(derived) =
        crypto_core::kdf::derive_pbkdf2(password.as_bytes(), &salt, iterations, expected.len())
    else {
        return false;
    };
    crypto_core::constant_time_eq(&derived, &expected)
}
