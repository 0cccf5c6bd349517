/// PKCE (RFC 7636), S256 only
///
/// `plain` is rejected at the authorize endpoint; this module only ever
/// compares S256 digests, in constant time.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crypto_core::digest::sha256;

/// Allowed challenge/verifier length band from RFC 7636 §4.1.
const MIN_LEN: usize = 43;
const MAX_LEN: usize = 128;

/// Syntactic check for a challenge as received at `/authorize`.
pub fn is_valid_challenge(challenge: &str) -> bool {
    challenge.len() >= MIN_LEN
        && challenge.len() <= MAX_LEN
        && challenge
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~'))
}

/// S256 verification: `base64url_nopad(sha256(verifier)) == challenge`.
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    if verifier.len() < MIN_LEN || verifier.len() > MAX_LEN {
        return false;
    }
    let computed = URL_SAFE_NO_PAD.encode(sha256(verifier.as_bytes()));
    crypto_core::constant_time_eq(computed.as_bytes(), challenge.as_bytes())
}
