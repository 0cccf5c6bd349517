//! Shamir k-of-n secret sharing over GF(2^8).
//!
//! Used only for the unseal key: `split` at initialization, `combine` during
//! unseal. Shares travel as base64url `index ‖ payload`; index 0 is invalid
//! (it would evaluate the polynomial at the secret itself).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use zeroize::Zeroizing;

use super::BarrierError;

/// One share of a split secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub index: u8,
    pub data: Zeroizing<Vec<u8>>,
}

impl Share {
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(self.data.len() + 1);
        raw.push(self.index);
        raw.extend_from_slice(&self.data);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(encoded: &str) -> Result<Self, BarrierError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| BarrierError::InvalidShare)?;
        if raw.len() < 2 || raw[0] == 0 {
            return Err(BarrierError::InvalidShare);
        }
        Ok(Share {
            index: raw[0],
            data: Zeroizing::new(raw[1..].to_vec()),
        })
    }
}

/// Split `secret` into `n` shares, any `k` of which reconstruct it.
pub fn split(secret: &[u8], n: u8, k: u8) -> Result<Vec<Share>, BarrierError> {
    if n == 0 || k == 0 || k > n || secret.is_empty() {
        return Err(BarrierError::InvalidShare);
    }

    let mut shares: Vec<Share> = (1..=n)
        .map(|index| Share {
            index,
            data: Zeroizing::new(Vec::with_capacity(secret.len())),
        })
        .collect();

    for &byte in secret {
        // Random polynomial of degree k-1 with the secret byte as constant
        // term.
        let mut coefficients = Zeroizing::new(vec![0u8; k as usize]);
        coefficients[0] = byte;
        let random = crypto_core::random_bytes(k as usize - 1);
        coefficients[1..].copy_from_slice(&random);

        for share in shares.iter_mut() {
            share.data.push(eval_poly(&coefficients, share.index));
        }
    }

    Ok(shares)
}

/// Reconstruct the secret from shares via Lagrange interpolation at x = 0.
/// Duplicate indices are rejected; the caller passes exactly the threshold
/// number of shares (surplus shares are its concern to drop).
pub fn combine(shares: &[Share]) -> Result<Zeroizing<Vec<u8>>, BarrierError> {
    let first = shares.first().ok_or(BarrierError::InvalidShare)?;
    let len = first.data.len();
    if len == 0 || shares.iter().any(|s| s.data.len() != len) {
        return Err(BarrierError::InvalidShare);
    }
    for (i, a) in shares.iter().enumerate() {
        if shares[i + 1..].iter().any(|b| b.index == a.index) {
            return Err(BarrierError::InvalidShare);
        }
    }

    let mut secret = Zeroizing::new(vec![0u8; len]);
    for (byte_idx, out) in secret.iter_mut().enumerate() {
        let mut acc = 0u8;
        for share in shares {
            let mut basis = 1u8;
            for other in shares {
                if other.index != share.index {
                    // l_i(0) = Π x_j / (x_j - x_i); subtraction is XOR.
                    basis = gf_mul(
                        basis,
                        gf_div(other.index, other.index ^ share.index)?,
                    );
                }
            }
            acc ^= gf_mul(share.data[byte_idx], basis);
        }
        *out = acc;
    }
    Ok(secret)
}

fn eval_poly(coefficients: &[u8], x: u8) -> u8 {
    // Horner evaluation, highest coefficient first.
    let mut acc = 0u8;
    for &c in coefficients.iter().rev() {
        acc = gf_mul(acc, x) ^ c;
    }
    acc
}

/// Carry-less multiplication modulo the AES polynomial 0x11b.
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

fn gf_div(a: u8, b: u8) -> Result<u8, BarrierError> {
    if b == 0 {
        return Err(BarrierError::InvalidShare);
    }
    Ok(gf_mul(a, gf_inv(b)))
}

fn gf_inv(a: u8) -> u8 {
    // a^254 in GF(2^8).
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u32;
    while exp > 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_combine_round_trip() {
        let secret = crypto_core::random_bytes(32);
        let shares = split(&secret, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        let recovered = combine(&shares[..3]).unwrap();
        assert_eq!(recovered.as_slice(), secret.as_slice());

        // Any subset of size k works.
        let subset = [shares[4].clone(), shares[1].clone(), shares[3].clone()];
        assert_eq!(combine(&subset).unwrap().as_slice(), secret.as_slice());
    }

    #[test]
    fn test_fewer_than_threshold_yields_garbage() {
        let secret = crypto_core::random_bytes(32);
        let shares = split(&secret, 5, 3).unwrap();
        let partial = combine(&shares[..2]).unwrap();
        assert_ne!(partial.as_slice(), secret.as_slice());
    }

    #[test]
    fn test_duplicate_share_rejected() {
        let shares = split(b"secret material!", 3, 2).unwrap();
        let dup = [shares[0].clone(), shares[0].clone()];
        assert!(combine(&dup).is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let shares = split(b"secret material!", 3, 2).unwrap();
        for share in &shares {
            let decoded = Share::decode(&share.encode()).unwrap();
            assert_eq!(&decoded, share);
        }
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(split(b"s", 0, 0).is_err());
        assert!(split(b"s", 3, 4).is_err());
        assert!(split(b"", 3, 2).is_err());
        assert!(Share::decode("!!!").is_err());
        assert!(Share::decode("").is_err());
    }

    #[test]
    fn test_gf_field_properties() {
        // Multiplicative inverse round-trips for all non-zero elements.
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "inverse failed for {a}");
        }
        assert_eq!(gf_mul(0, 7), 0);
    }

    #[test]
    fn test_one_of_one_split() {
        let secret = b"single share secret".to_vec();
        let shares = split(&secret, 1, 1).unwrap();
        assert_eq!(combine(&shares).unwrap().as_slice(), secret.as_slice());
    }
}
