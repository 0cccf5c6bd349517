//! Envelope ciphertext format.
//!
//! `base64url( version ‖ key_id(16) ‖ nonce(12) ‖ ciphertext‖tag )`. The key
//! id rides inside the ciphertext so decryption always uses the key that
//! sealed it, regardless of rotations since.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

use crypto_core::aead::{aead_open, aead_seal, AeadAlgorithm, NONCE_LEN};

use super::BarrierError;

pub const ENVELOPE_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 16 + NONCE_LEN;

/// Seal `plaintext` under `key`, naming `key_id` in the envelope header.
pub fn seal(
    key_id: &str,
    key: &[u8],
    alg: AeadAlgorithm,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<String, BarrierError> {
    let id = Uuid::parse_str(key_id).map_err(|_| BarrierError::KeyNotFound)?;
    let nonce = crypto_core::random_array::<NONCE_LEN>();
    let ciphertext = aead_seal(alg, key, &nonce, aad, plaintext)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(out))
}

/// Key id named inside an envelope, without decrypting it.
pub fn key_id(envelope: &str) -> Result<String, BarrierError> {
    let raw = decode(envelope)?;
    Ok(Uuid::from_slice(&raw[1..17])
        .map_err(|_| BarrierError::KeyNotFound)?
        .to_string())
}

/// Open an envelope with the key the caller resolved from [`key_id`].
pub fn open(
    envelope: &str,
    key: &[u8],
    alg: AeadAlgorithm,
    aad: &[u8],
) -> Result<Vec<u8>, BarrierError> {
    let raw = decode(envelope)?;
    let nonce = &raw[17..HEADER_LEN];
    let ciphertext = &raw[HEADER_LEN..];
    Ok(aead_open(alg, key, nonce, aad, ciphertext)?)
}

fn decode(envelope: &str) -> Result<Vec<u8>, BarrierError> {
    let raw = URL_SAFE_NO_PAD
        .decode(envelope)
        .map_err(|_| BarrierError::KeyNotFound)?;
    if raw.len() < HEADER_LEN + 16 || raw[0] != ENVELOPE_VERSION {
        return Err(BarrierError::KeyNotFound);
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_key_id() {
        let id = Uuid::now_v7().to_string();
        let key = crypto_core::random_bytes(32);
        let env = seal(&id, &key, AeadAlgorithm::Aes256Gcm, b"ctx", b"payload").unwrap();

        assert_eq!(key_id(&env).unwrap(), id);
        let pt = open(&env, &key, AeadAlgorithm::Aes256Gcm, b"ctx").unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let id = Uuid::now_v7().to_string();
        let key = crypto_core::random_bytes(32);
        let env = seal(&id, &key, AeadAlgorithm::Aes256Gcm, b"ctx", b"payload").unwrap();
        assert!(open(&env, &key, AeadAlgorithm::Aes256Gcm, b"other").is_err());
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        assert!(key_id("AAAA").is_err());
        assert!(key_id("").is_err());
    }
}
