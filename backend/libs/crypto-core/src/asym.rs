//! Asymmetric key generation, signing, and verification.
//!
//! Keys cross module boundaries as PEM (PKCS#8 private, SPKI public) so the
//! JOSE layer and the KMS can share material without exposing crate-specific
//! key types. Private PEM strings zeroize on drop.

use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EcP256,
    EcP384,
    EcP521,
    Ed25519,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 => "RSA-2048",
            KeyAlgorithm::Rsa3072 => "RSA-3072",
            KeyAlgorithm::Rsa4096 => "RSA-4096",
            KeyAlgorithm::EcP256 => "EC-P256",
            KeyAlgorithm::EcP384 => "EC-P384",
            KeyAlgorithm::EcP521 => "EC-P521",
            KeyAlgorithm::Ed25519 => "Ed25519",
        }
    }
}

/// Generated keypair in portable PEM encodings.
pub struct Keypair {
    pub algorithm: KeyAlgorithm,
    pub private_key_pem: Zeroizing<String>,
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsaPkcs1Sha256,
    RsaPkcs1Sha384,
    RsaPkcs1Sha512,
    RsaPssSha256,
    RsaPssSha384,
    RsaPssSha512,
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    Ed25519,
}

/// Generate a fresh keypair for the given algorithm.
///
/// P-521 is not part of the vetted stack and is reported as unsupported
/// rather than silently substituted.
pub fn generate_keypair(alg: KeyAlgorithm) -> Result<Keypair> {
    match alg {
        KeyAlgorithm::Rsa2048 => generate_rsa(alg, 2048),
        KeyAlgorithm::Rsa3072 => generate_rsa(alg, 3072),
        KeyAlgorithm::Rsa4096 => generate_rsa(alg, 4096),
        KeyAlgorithm::EcP256 => {
            use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

            let secret = p256::SecretKey::random(&mut OsRng);
            let private_key_pem = secret
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|_| CryptoError::InvalidKey)?;
            let public_key_pem = secret
                .public_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|_| CryptoError::InvalidKey)?;
            Ok(Keypair {
                algorithm: alg,
                private_key_pem,
                public_key_pem,
            })
        }
        KeyAlgorithm::EcP384 => {
            use p384::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

            let secret = p384::SecretKey::random(&mut OsRng);
            let private_key_pem = secret
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|_| CryptoError::InvalidKey)?;
            let public_key_pem = secret
                .public_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|_| CryptoError::InvalidKey)?;
            Ok(Keypair {
                algorithm: alg,
                private_key_pem,
                public_key_pem,
            })
        }
        KeyAlgorithm::EcP521 => Err(CryptoError::AlgorithmUnsupported("EC-P521".into())),
        KeyAlgorithm::Ed25519 => {
            use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
            use pkcs8::LineEnding;

            let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
            let private_key_pem = signing
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|_| CryptoError::InvalidKey)?;
            let public_key_pem = signing
                .verifying_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|_| CryptoError::InvalidKey)?;
            Ok(Keypair {
                algorithm: alg,
                private_key_pem,
                public_key_pem,
            })
        }
    }
}

fn generate_rsa(alg: KeyAlgorithm, bits: usize) -> Result<Keypair> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let private = rsa::RsaPrivateKey::new(&mut OsRng, bits).map_err(|_| CryptoError::InvalidKey)?;
    let public = rsa::RsaPublicKey::from(&private);
    let private_key_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|_| CryptoError::InvalidKey)?;
    let public_key_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| CryptoError::InvalidKey)?;
    Ok(Keypair {
        algorithm: alg,
        private_key_pem,
        public_key_pem,
    })
}

/// Sign `message` with a PKCS#8 PEM private key under the given scheme.
pub fn sign(scheme: SignatureScheme, private_key_pem: &str, message: &[u8]) -> Result<Vec<u8>> {
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer};

    match scheme {
        SignatureScheme::RsaPkcs1Sha256 => {
            let key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key);
            Ok(signer.sign(message).to_vec())
        }
        SignatureScheme::RsaPkcs1Sha384 => {
            let key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha384>::new(key);
            Ok(signer.sign(message).to_vec())
        }
        SignatureScheme::RsaPkcs1Sha512 => {
            let key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha512>::new(key);
            Ok(signer.sign(message).to_vec())
        }
        SignatureScheme::RsaPssSha256 => {
            let key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = rsa::pss::BlindedSigningKey::<sha2::Sha256>::new(key);
            Ok(signer.sign_with_rng(&mut OsRng, message).to_vec())
        }
        SignatureScheme::RsaPssSha384 => {
            let key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = rsa::pss::BlindedSigningKey::<sha2::Sha384>::new(key);
            Ok(signer.sign_with_rng(&mut OsRng, message).to_vec())
        }
        SignatureScheme::RsaPssSha512 => {
            let key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = rsa::pss::BlindedSigningKey::<sha2::Sha512>::new(key);
            Ok(signer.sign_with_rng(&mut OsRng, message).to_vec())
        }
        SignatureScheme::EcdsaP256Sha256 => {
            use p256::pkcs8::DecodePrivateKey;

            let secret = p256::SecretKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = p256::ecdsa::SigningKey::from(&secret);
            let sig: p256::ecdsa::Signature = signer.sign(message);
            Ok(sig.to_vec())
        }
        SignatureScheme::EcdsaP384Sha384 => {
            use p384::pkcs8::DecodePrivateKey;

            let secret = p384::SecretKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let signer = p384::ecdsa::SigningKey::from(&secret);
            let sig: p384::ecdsa::Signature = signer.sign(message);
            Ok(sig.to_vec())
        }
        SignatureScheme::Ed25519 => {
            use ed25519_dalek::pkcs8::DecodePrivateKey;

            let signer = ed25519_dalek::SigningKey::from_pkcs8_pem(private_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let sig: ed25519_dalek::Signature = signer.sign(message);
            Ok(sig.to_vec())
        }
    }
}

/// Verify `signature` over `message` against an SPKI PEM public key.
pub fn verify(
    scheme: SignatureScheme,
    public_key_pem: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::signature::Verifier;

    match scheme {
        SignatureScheme::RsaPkcs1Sha256 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::RsaPkcs1Sha384 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = rsa::pkcs1v15::VerifyingKey::<sha2::Sha384>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::RsaPkcs1Sha512 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = rsa::pkcs1v15::VerifyingKey::<sha2::Sha512>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::RsaPssSha256 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = rsa::pss::VerifyingKey::<sha2::Sha256>::new(key);
            let sig =
                rsa::pss::Signature::try_from(signature).map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::RsaPssSha384 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = rsa::pss::VerifyingKey::<sha2::Sha384>::new(key);
            let sig =
                rsa::pss::Signature::try_from(signature).map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::RsaPssSha512 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = rsa::pss::VerifyingKey::<sha2::Sha512>::new(key);
            let sig =
                rsa::pss::Signature::try_from(signature).map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::EcdsaP256Sha256 => {
            use p256::pkcs8::DecodePublicKey;

            let public = p256::PublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = p256::ecdsa::VerifyingKey::from(&public);
            let sig = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::EcdsaP384Sha384 => {
            use p384::pkcs8::DecodePublicKey;

            let public = p384::PublicKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let verifier = p384::ecdsa::VerifyingKey::from(&public);
            let sig = p384::ecdsa::Signature::from_slice(signature)
                .map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        SignatureScheme::Ed25519 => {
            use ed25519_dalek::pkcs8::DecodePublicKey;

            let verifier = ed25519_dalek::VerifyingKey::from_public_key_pem(public_key_pem)
                .map_err(|_| CryptoError::InvalidKey)?;
            let sig = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|_| CryptoError::VerifyFailed)?;
            verifier
                .verify(message, &sig)
                .map_err(|_| CryptoError::VerifyFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_sign_verify() {
        let kp = generate_keypair(KeyAlgorithm::Ed25519).unwrap();
        let sig = sign(SignatureScheme::Ed25519, &kp.private_key_pem, b"msg").unwrap();
        verify(SignatureScheme::Ed25519, &kp.public_key_pem, b"msg", &sig).unwrap();
        assert!(verify(SignatureScheme::Ed25519, &kp.public_key_pem, b"other", &sig).is_err());
    }

    #[test]
    fn test_p256_sign_verify() {
        let kp = generate_keypair(KeyAlgorithm::EcP256).unwrap();
        let sig = sign(SignatureScheme::EcdsaP256Sha256, &kp.private_key_pem, b"msg").unwrap();
        assert_eq!(sig.len(), 64);
        verify(
            SignatureScheme::EcdsaP256Sha256,
            &kp.public_key_pem,
            b"msg",
            &sig,
        )
        .unwrap();
    }

    #[test]
    fn test_p384_sign_verify() {
        let kp = generate_keypair(KeyAlgorithm::EcP384).unwrap();
        let sig = sign(SignatureScheme::EcdsaP384Sha384, &kp.private_key_pem, b"msg").unwrap();
        assert_eq!(sig.len(), 96);
        verify(
            SignatureScheme::EcdsaP384Sha384,
            &kp.public_key_pem,
            b"msg",
            &sig,
        )
        .unwrap();
    }

    #[test]
    fn test_rsa_sign_verify() {
        let kp = generate_keypair(KeyAlgorithm::Rsa2048).unwrap();
        let sig = sign(SignatureScheme::RsaPkcs1Sha256, &kp.private_key_pem, b"msg").unwrap();
        verify(
            SignatureScheme::RsaPkcs1Sha256,
            &kp.public_key_pem,
            b"msg",
            &sig,
        )
        .unwrap();

        let pss = sign(SignatureScheme::RsaPssSha256, &kp.private_key_pem, b"msg").unwrap();
        verify(
            SignatureScheme::RsaPssSha256,
            &kp.public_key_pem,
            b"msg",
            &pss,
        )
        .unwrap();
    }

    #[test]
    fn test_p521_unsupported() {
        assert!(matches!(
            generate_keypair(KeyAlgorithm::EcP521),
            Err(CryptoError::AlgorithmUnsupported(_))
        ));
    }

    #[test]
    fn test_verify_rejects_garbage_key() {
        let kp = generate_keypair(KeyAlgorithm::Ed25519).unwrap();
        let sig = sign(SignatureScheme::Ed25519, &kp.private_key_pem, b"msg").unwrap();
        assert!(matches!(
            verify(SignatureScheme::Ed25519, "not a pem", b"msg", &sig),
            Err(CryptoError::InvalidKey)
        ));
    }
}
