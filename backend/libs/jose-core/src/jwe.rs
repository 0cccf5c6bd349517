//! Compact JWE encryption and decryption.
//!
//! Key management: `dir`, `A256KW`, `RSA-OAEP-256`, `ECDH-ES+A256KW` (P-256).
//! Content encryption: `A128GCM`, `A256GCM`, `A256CBC-HS512`. Built from the
//! same RustCrypto primitives the rest of the platform uses.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crypto_core::aead::{aead_open, aead_seal, AeadAlgorithm};

use crate::{JoseError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyManagementAlgorithm {
    Dir,
    A256Kw,
    RsaOaep256,
    EcdhEsA256Kw,
}

impl KeyManagementAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            KeyManagementAlgorithm::Dir => "dir",
            KeyManagementAlgorithm::A256Kw => "A256KW",
            KeyManagementAlgorithm::RsaOaep256 => "RSA-OAEP-256",
            KeyManagementAlgorithm::EcdhEsA256Kw => "ECDH-ES+A256KW",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "dir" => Ok(KeyManagementAlgorithm::Dir),
            "A256KW" => Ok(KeyManagementAlgorithm::A256Kw),
            "RSA-OAEP-256" => Ok(KeyManagementAlgorithm::RsaOaep256),
            "ECDH-ES+A256KW" => Ok(KeyManagementAlgorithm::EcdhEsA256Kw),
            other => Err(JoseError::AlgorithmUnsupported(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncryptionAlgorithm {
    A128Gcm,
    A256Gcm,
    A256CbcHs512,
}

impl ContentEncryptionAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            ContentEncryptionAlgorithm::A128Gcm => "A128GCM",
            ContentEncryptionAlgorithm::A256Gcm => "A256GCM",
            ContentEncryptionAlgorithm::A256CbcHs512 => "A256CBC-HS512",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "A128GCM" => Ok(ContentEncryptionAlgorithm::A128Gcm),
            "A256GCM" => Ok(ContentEncryptionAlgorithm::A256Gcm),
            "A256CBC-HS512" => Ok(ContentEncryptionAlgorithm::A256CbcHs512),
            other => Err(JoseError::AlgorithmUnsupported(other.to_string())),
        }
    }

    fn cek_len(&self) -> usize {
        match self {
            ContentEncryptionAlgorithm::A128Gcm => 16,
            ContentEncryptionAlgorithm::A256Gcm => 32,
            ContentEncryptionAlgorithm::A256CbcHs512 => 64,
        }
    }

    fn iv_len(&self) -> usize {
        match self {
            ContentEncryptionAlgorithm::A128Gcm | ContentEncryptionAlgorithm::A256Gcm => 12,
            ContentEncryptionAlgorithm::A256CbcHs512 => 16,
        }
    }
}

/// Key material for JWE operations. The variant must match the key
/// management algorithm.
pub enum JweKey<'a> {
    /// `dir` CEK or `A256KW` wrapping key.
    Symmetric(&'a [u8]),
    /// `RSA-OAEP-256` recipient public key (encrypt side).
    RsaPublicPem(&'a str),
    /// `RSA-OAEP-256` recipient private key (decrypt side).
    RsaPrivatePem(&'a str),
    /// `ECDH-ES+A256KW` recipient public key (encrypt side).
    EcPublicPem(&'a str),
    /// `ECDH-ES+A256KW` recipient private key (decrypt side).
    EcPrivatePem(&'a str),
}

#[derive(Debug, Serialize, Deserialize)]
struct EphemeralKey {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    epk: Option<EphemeralKey>,
}

/// Encrypt `plaintext` into a compact JWE.
pub fn encrypt(
    alg: KeyManagementAlgorithm,
    enc: ContentEncryptionAlgorithm,
    key: &JweKey<'_>,
    plaintext: &[u8],
) -> Result<String> {
    let mut header = JweHeader {
        alg: alg.as_str().to_string(),
        enc: enc.as_str().to_string(),
        epk: None,
    };

    // Establish the CEK and the encrypted-key segment.
    let (cek, encrypted_key): (Zeroizing<Vec<u8>>, Vec<u8>) = match (alg, key) {
        (KeyManagementAlgorithm::Dir, JweKey::Symmetric(k)) => {
            if k.len() != enc.cek_len() {
                return Err(JoseError::InvalidKey);
            }
            (Zeroizing::new(k.to_vec()), Vec::new())
        }
        (KeyManagementAlgorithm::A256Kw, JweKey::Symmetric(k)) => {
            let cek = Zeroizing::new(crypto_core::random_bytes(enc.cek_len()));
            let wrapped = wrap_a256kw(k, &cek)?;
            (cek, wrapped)
        }
        (KeyManagementAlgorithm::RsaOaep256, JweKey::RsaPublicPem(pem)) => {
            use rsa::pkcs8::DecodePublicKey;

            let public = rsa::RsaPublicKey::from_public_key_pem(pem)
                .map_err(|_| JoseError::InvalidKey)?;
            let cek = Zeroizing::new(crypto_core::random_bytes(enc.cek_len()));
            let wrapped = public
                .encrypt(&mut OsRng, rsa::Oaep::new::<Sha256>(), &cek)
                .map_err(|_| JoseError::InvalidKey)?;
            (cek, wrapped)
        }
        (KeyManagementAlgorithm::EcdhEsA256Kw, JweKey::EcPublicPem(pem)) => {
            use p256::elliptic_curve::sec1::ToEncodedPoint;
            use p256::pkcs8::DecodePublicKey;

            let recipient = p256::PublicKey::from_public_key_pem(pem)
                .map_err(|_| JoseError::InvalidKey)?;
            let ephemeral = p256::ecdh::EphemeralSecret::random(&mut OsRng);
            let ephemeral_public = p256::PublicKey::from(&ephemeral);
            let shared = ephemeral.diffie_hellman(&recipient);
            let kek = concat_kdf(shared.raw_secret_bytes().as_slice(), "A256KW", 32);

            let point = ephemeral_public.to_encoded_point(false);
            header.epk = Some(EphemeralKey {
                kty: "EC".to_string(),
                crv: "P-256".to_string(),
                x: URL_SAFE_NO_PAD.encode(point.x().ok_or(JoseError::InvalidKey)?),
                y: URL_SAFE_NO_PAD.encode(point.y().ok_or(JoseError::InvalidKey)?),
            });

            let cek = Zeroizing::new(crypto_core::random_bytes(enc.cek_len()));
            let wrapped = wrap_a256kw(&kek, &cek)?;
            (cek, wrapped)
        }
        _ => return Err(JoseError::InvalidKey),
    };

    let header_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).map_err(|_| JoseError::Malformed)?);
    let aad = header_b64.as_bytes();
    let iv = crypto_core::random_bytes(enc.iv_len());

    let (ciphertext, tag) = match enc {
        ContentEncryptionAlgorithm::A128Gcm => {
            let sealed = aead_seal(AeadAlgorithm::Aes128Gcm, &cek, &iv, aad, plaintext)
                .map_err(|_| JoseError::InvalidKey)?;
            split_gcm(sealed)
        }
        ContentEncryptionAlgorithm::A256Gcm => {
            let sealed = aead_seal(AeadAlgorithm::Aes256Gcm, &cek, &iv, aad, plaintext)
                .map_err(|_| JoseError::InvalidKey)?;
            split_gcm(sealed)
        }
        ContentEncryptionAlgorithm::A256CbcHs512 => cbc_hs512_seal(&cek, &iv, aad, plaintext)?,
    };

    Ok(format!(
        "{}.{}.{}.{}.{}",
        header_b64,
        URL_SAFE_NO_PAD.encode(encrypted_key),
        URL_SAFE_NO_PAD.encode(&iv),
        URL_SAFE_NO_PAD.encode(&ciphertext),
        URL_SAFE_NO_PAD.encode(&tag),
    ))
}

/// Decrypt a compact JWE.
pub fn decrypt(token: &str, key: &JweKey<'_>) -> Result<Vec<u8>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 5 {
        return Err(JoseError::Malformed);
    }
    let header_b64 = parts[0];
    let header_raw = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| JoseError::Malformed)?;
    let header: JweHeader =
        serde_json::from_slice(&header_raw).map_err(|_| JoseError::Malformed)?;
    let alg = KeyManagementAlgorithm::parse(&header.alg)?;
    let enc = ContentEncryptionAlgorithm::parse(&header.enc)?;

    let encrypted_key = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| JoseError::Malformed)?;
    let iv = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| JoseError::Malformed)?;
    let ciphertext = URL_SAFE_NO_PAD
        .decode(parts[3])
        .map_err(|_| JoseError::Malformed)?;
    let tag = URL_SAFE_NO_PAD
        .decode(parts[4])
        .map_err(|_| JoseError::Malformed)?;

    let cek: Zeroizing<Vec<u8>> = match (alg, key) {
        (KeyManagementAlgorithm::Dir, JweKey::Symmetric(k)) => {
            if !encrypted_key.is_empty() || k.len() != enc.cek_len() {
                return Err(JoseError::InvalidKey);
            }
            Zeroizing::new(k.to_vec())
        }
        (KeyManagementAlgorithm::A256Kw, JweKey::Symmetric(k)) => {
            Zeroizing::new(unwrap_a256kw(k, &encrypted_key)?)
        }
        (KeyManagementAlgorithm::RsaOaep256, JweKey::RsaPrivatePem(pem)) => {
            use rsa::pkcs8::DecodePrivateKey;

            let private = rsa::RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|_| JoseError::InvalidKey)?;
            Zeroizing::new(
                private
                    .decrypt(rsa::Oaep::new::<Sha256>(), &encrypted_key)
                    .map_err(|_| JoseError::DecryptionFailed)?,
            )
        }
        (KeyManagementAlgorithm::EcdhEsA256Kw, JweKey::EcPrivatePem(pem)) => {
            use p256::pkcs8::DecodePrivateKey;

            let epk = header.epk.as_ref().ok_or(JoseError::Malformed)?;
            if epk.crv != "P-256" {
                return Err(JoseError::AlgorithmUnsupported(epk.crv.clone()));
            }
            let x = URL_SAFE_NO_PAD
                .decode(&epk.x)
                .map_err(|_| JoseError::Malformed)?;
            let y = URL_SAFE_NO_PAD
                .decode(&epk.y)
                .map_err(|_| JoseError::Malformed)?;
            let point = p256::EncodedPoint::from_affine_coordinates(
                p256::FieldBytes::from_slice(&left_pad(&x, 32)?),
                p256::FieldBytes::from_slice(&left_pad(&y, 32)?),
                false,
            );
            let ephemeral_public =
                p256::PublicKey::from_sec1_bytes(point.as_bytes())
                    .map_err(|_| JoseError::Malformed)?;

            let secret =
                p256::SecretKey::from_pkcs8_pem(pem).map_err(|_| JoseError::InvalidKey)?;
            let shared = p256::ecdh::diffie_hellman(
                secret.to_nonzero_scalar(),
                ephemeral_public.as_affine(),
            );
            let kek = concat_kdf(shared.raw_secret_bytes().as_slice(), "A256KW", 32);
            Zeroizing::new(unwrap_a256kw(&kek, &encrypted_key)?)
        }
        _ => return Err(JoseError::InvalidKey),
    };

    if cek.len() != enc.cek_len() || iv.len() != enc.iv_len() {
        return Err(JoseError::DecryptionFailed);
    }

    let aad = header_b64.as_bytes();
    match enc {
        ContentEncryptionAlgorithm::A128Gcm => {
            let mut sealed = ciphertext;
            sealed.extend_from_slice(&tag);
            aead_open(AeadAlgorithm::Aes128Gcm, &cek, &iv, aad, &sealed)
                .map_err(|_| JoseError::DecryptionFailed)
        }
        ContentEncryptionAlgorithm::A256Gcm => {
            let mut sealed = ciphertext;
            sealed.extend_from_slice(&tag);
            aead_open(AeadAlgorithm::Aes256Gcm, &cek, &iv, aad, &sealed)
                .map_err(|_| JoseError::DecryptionFailed)
        }
        ContentEncryptionAlgorithm::A256CbcHs512 => {
            cbc_hs512_open(&cek, &iv, aad, &ciphertext, &tag)
        }
    }
}

fn split_gcm(mut sealed: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    let tag = sealed.split_off(sealed.len() - 16);
    (sealed, tag)
}

fn wrap_a256kw(kek: &[u8], cek: &[u8]) -> Result<Vec<u8>> {
    let kek_bytes: [u8; 32] = kek.try_into().map_err(|_| JoseError::InvalidKey)?;
    let kek = aes_kw::KekAes256::from(kek_bytes);
    kek.wrap_vec(cek).map_err(|_| JoseError::InvalidKey)
}

fn unwrap_a256kw(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    let kek_bytes: [u8; 32] = kek.try_into().map_err(|_| JoseError::InvalidKey)?;
    let kek = aes_kw::KekAes256::from(kek_bytes);
    kek.unwrap_vec(wrapped)
        .map_err(|_| JoseError::DecryptionFailed)
}

/// One-round Concat KDF (SP 800-56A), sufficient for 256-bit outputs.
fn concat_kdf(z: &[u8], alg: &str, out_len: usize) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(1u32.to_be_bytes());
    hasher.update(z);
    hasher.update((alg.len() as u32).to_be_bytes());
    hasher.update(alg.as_bytes());
    hasher.update(0u32.to_be_bytes()); // apu
    hasher.update(0u32.to_be_bytes()); // apv
    hasher.update(((out_len * 8) as u32).to_be_bytes());
    hasher.finalize()[..out_len].to_vec()
}

fn cbc_hs512_seal(cek: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let (mac_key, enc_key) = cek.split_at(32);
    let cipher =
        Aes256CbcEnc::new_from_slices(enc_key, iv).map_err(|_| JoseError::InvalidKey)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let tag = cbc_hs512_tag(mac_key, aad, iv, &ciphertext)?;
    Ok((ciphertext, tag))
}

fn cbc_hs512_open(
    cek: &[u8],
    iv: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>> {
    let (mac_key, enc_key) = cek.split_at(32);
    let expected = cbc_hs512_tag(mac_key, aad, iv, ciphertext)?;
    if !crypto_core::constant_time_eq(&expected, tag) {
        return Err(JoseError::DecryptionFailed);
    }
    let cipher =
        Aes256CbcDec::new_from_slices(enc_key, iv).map_err(|_| JoseError::InvalidKey)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| JoseError::DecryptionFailed)
}

fn cbc_hs512_tag(mac_key: &[u8], aad: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(mac_key).map_err(|_| JoseError::InvalidKey)?;
    mac.update(aad);
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(((aad.len() as u64) * 8).to_be_bytes().as_slice());
    Ok(mac.finalize().into_bytes()[..32].to_vec())
}

fn left_pad(bytes: &[u8], len: usize) -> Result<Vec<u8>> {
    if bytes.len() > len {
        return Err(JoseError::Malformed);
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_core::asym::{generate_keypair, KeyAlgorithm};

    #[test]
    fn test_dir_a256gcm_round_trip() {
        let key = crypto_core::random_bytes(32);
        let token = encrypt(
            KeyManagementAlgorithm::Dir,
            ContentEncryptionAlgorithm::A256Gcm,
            &JweKey::Symmetric(&key),
            b"secret payload",
        )
        .unwrap();
        assert_eq!(token.split('.').count(), 5);
        let pt = decrypt(&token, &JweKey::Symmetric(&key)).unwrap();
        assert_eq!(pt, b"secret payload");
    }

    #[test]
    fn test_dir_a256cbc_hs512_round_trip() {
        let key = crypto_core::random_bytes(64);
        let token = encrypt(
            KeyManagementAlgorithm::Dir,
            ContentEncryptionAlgorithm::A256CbcHs512,
            &JweKey::Symmetric(&key),
            b"cbc payload",
        )
        .unwrap();
        let pt = decrypt(&token, &JweKey::Symmetric(&key)).unwrap();
        assert_eq!(pt, b"cbc payload");
    }

    #[test]
    fn test_a256kw_a128gcm_round_trip() {
        let kek = crypto_core::random_bytes(32);
        let token = encrypt(
            KeyManagementAlgorithm::A256Kw,
            ContentEncryptionAlgorithm::A128Gcm,
            &JweKey::Symmetric(&kek),
            b"wrapped",
        )
        .unwrap();
        let pt = decrypt(&token, &JweKey::Symmetric(&kek)).unwrap();
        assert_eq!(pt, b"wrapped");
    }

    #[test]
    fn test_rsa_oaep_256_round_trip() {
        let kp = generate_keypair(KeyAlgorithm::Rsa2048).unwrap();
        let token = encrypt(
            KeyManagementAlgorithm::RsaOaep256,
            ContentEncryptionAlgorithm::A256Gcm,
            &JweKey::RsaPublicPem(&kp.public_key_pem),
            b"rsa sealed",
        )
        .unwrap();
        let pt = decrypt(&token, &JweKey::RsaPrivatePem(&kp.private_key_pem)).unwrap();
        assert_eq!(pt, b"rsa sealed");
    }

    #[test]
    fn test_ecdh_es_a256kw_round_trip() {
        let kp = generate_keypair(KeyAlgorithm::EcP256).unwrap();
        let token = encrypt(
            KeyManagementAlgorithm::EcdhEsA256Kw,
            ContentEncryptionAlgorithm::A256Gcm,
            &JweKey::EcPublicPem(&kp.public_key_pem),
            b"ecdh sealed",
        )
        .unwrap();
        let pt = decrypt(&token, &JweKey::EcPrivatePem(&kp.private_key_pem)).unwrap();
        assert_eq!(pt, b"ecdh sealed");
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let key = crypto_core::random_bytes(32);
        let token = encrypt(
            KeyManagementAlgorithm::Dir,
            ContentEncryptionAlgorithm::A256Gcm,
            &JweKey::Symmetric(&key),
            b"payload",
        )
        .unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[4] = URL_SAFE_NO_PAD.encode([0u8; 16]);
        let forged = parts.join(".");
        assert!(decrypt(&forged, &JweKey::Symmetric(&key)).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = crypto_core::random_bytes(32);
        let other = crypto_core::random_bytes(32);
        let token = encrypt(
            KeyManagementAlgorithm::Dir,
            ContentEncryptionAlgorithm::A256Gcm,
            &JweKey::Symmetric(&key),
            b"payload",
        )
        .unwrap();
        assert!(decrypt(&token, &JweKey::Symmetric(&other)).is_err());
    }

    #[test]
    fn test_dir_key_length_enforced() {
        let short = crypto_core::random_bytes(16);
        assert!(encrypt(
            KeyManagementAlgorithm::Dir,
            ContentEncryptionAlgorithm::A256Gcm,
            &JweKey::Symmetric(&short),
            b"x",
        )
        .is_err());
    }
}
