//! Key derivation: PBKDF2-HMAC-SHA256 for password material, HKDF-SHA256 for
//! key-hierarchy derivations.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::{CryptoError, Result};

/// Derive `out_len` bytes from a password with PBKDF2-HMAC-SHA256.
///
/// The iteration floor is enforced by callers (credential storage uses
/// 600k+); this primitive only refuses the degenerate zero case.
pub fn derive_pbkdf2(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    out_len: usize,
) -> Result<Vec<u8>> {
    if iterations == 0 || out_len == 0 {
        return Err(CryptoError::InvalidLength);
    }
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    Ok(out)
}

/// HKDF-SHA256 extract-and-expand.
pub fn hkdf_derive(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out)
        .map_err(|_| CryptoError::InvalidLength)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbkdf2_deterministic() {
        let a = derive_pbkdf2(b"password", b"salt-salt-salt-salt", 1000, 32).unwrap();
        let b = derive_pbkdf2(b"password", b"salt-salt-salt-salt", 1000, 32).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_pbkdf2_salt_sensitivity() {
        let a = derive_pbkdf2(b"password", b"salt-a", 1000, 32).unwrap();
        let b = derive_pbkdf2(b"password", b"salt-b", 1000, 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_pbkdf2_rejects_zero_iterations() {
        assert!(matches!(
            derive_pbkdf2(b"pw", b"salt", 0, 32),
            Err(CryptoError::InvalidLength)
        ));
    }

    #[test]
    fn test_hkdf_info_separation() {
        let ikm = b"input keying material";
        let a = hkdf_derive(ikm, b"salt", b"integrity", 32).unwrap();
        let b = hkdf_derive(ikm, b"salt", b"encryption", 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hkdf_rejects_oversized_output() {
        // HKDF-SHA256 output is capped at 255 * 32 bytes.
        assert!(hkdf_derive(b"ikm", b"salt", b"info", 255 * 32 + 1).is_err());
    }
}
