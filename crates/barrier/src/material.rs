//! Key material types and the generators that produce them.
//!
//! Secret bytes never appear in `Debug` output and are zeroed when dropped.
//! Generation is synchronous and may be slow (RSA-4096 takes seconds), so the
//! pool always runs it on the blocking thread pool.

use std::{fmt, str::FromStr};

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte length of the AES-256 keys used by every barrier tier.
pub const BARRIER_KEY_LEN: usize = 32;

/// Algorithm classes the key material pool can keep buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyAlgorithm {
    Aes128,
    Aes192,
    Aes256,
    Hmac256,
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EcP256,
    Ed25519,
    X25519,
}

impl KeyAlgorithm {
    /// Every algorithm this build knows how to generate.
    pub const ALL: [KeyAlgorithm; 10] = [
        KeyAlgorithm::Aes128,
        KeyAlgorithm::Aes192,
        KeyAlgorithm::Aes256,
        KeyAlgorithm::Hmac256,
        KeyAlgorithm::Rsa2048,
        KeyAlgorithm::Rsa3072,
        KeyAlgorithm::Rsa4096,
        KeyAlgorithm::EcP256,
        KeyAlgorithm::Ed25519,
        KeyAlgorithm::X25519,
    ];

    /// Stable lowercase name used in configuration, logs, and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Aes128 => "aes128",
            KeyAlgorithm::Aes192 => "aes192",
            KeyAlgorithm::Aes256 => "aes256",
            KeyAlgorithm::Hmac256 => "hmac256",
            KeyAlgorithm::Rsa2048 => "rsa2048",
            KeyAlgorithm::Rsa3072 => "rsa3072",
            KeyAlgorithm::Rsa4096 => "rsa4096",
            KeyAlgorithm::EcP256 => "ec-p256",
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::X25519 => "x25519",
        }
    }

    /// `true` for algorithms whose material is a single random secret.
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            KeyAlgorithm::Aes128 | KeyAlgorithm::Aes192 | KeyAlgorithm::Aes256 | KeyAlgorithm::Hmac256
        )
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = KeygenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        KeyAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == wanted)
            .ok_or(KeygenError::UnknownAlgorithm(wanted))
    }
}

/// Errors produced while generating key material.
#[derive(Debug, Error)]
pub enum KeygenError {
    /// The algorithm name is not one this build implements.
    #[error("unknown key algorithm: {0}")]
    UnknownAlgorithm(String),

    /// The underlying primitive failed to produce or encode a key.
    #[error("key generation failed for {algorithm}: {reason}")]
    Failed {
        algorithm: KeyAlgorithm,
        reason: String,
    },
}

/// Heap buffer of secret bytes, zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material, not even in debug builds.
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

/// Freshly generated key material handed out by the pool.
///
/// Asymmetric material carries the PKCS#8 (RSA), scalar (P-256) or seed
/// (Ed25519/X25519) private bytes in `secret` and the public key in `public`.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    algorithm: KeyAlgorithm,
    secret: SecretBytes,
    public: Option<Vec<u8>>,
}

impl KeyMaterial {
    pub fn symmetric(algorithm: KeyAlgorithm, secret: SecretBytes) -> Self {
        Self {
            algorithm,
            secret,
            public: None,
        }
    }

    pub fn asymmetric(algorithm: KeyAlgorithm, secret: SecretBytes, public: Vec<u8>) -> Self {
        Self {
            algorithm,
            secret,
            public: Some(public),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn secret(&self) -> &SecretBytes {
        &self.secret
    }

    pub fn public(&self) -> Option<&[u8]> {
        self.public.as_deref()
    }

    /// Consume the material, keeping only the secret part.
    pub fn into_secret(self) -> SecretBytes {
        self.secret
    }
}

/// Source of new key material.
///
/// Implementations must be cheap to share across worker tasks.
pub trait MaterialGenerator: Send + Sync + 'static {
    /// Generate one item of key material. Called on the blocking thread pool.
    fn generate(&self, algorithm: KeyAlgorithm) -> Result<KeyMaterial, KeygenError>;
}

/// Generator backed by the operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGenerator;

impl MaterialGenerator for SystemGenerator {
    fn generate(&self, algorithm: KeyAlgorithm) -> Result<KeyMaterial, KeygenError> {
        match algorithm {
            KeyAlgorithm::Aes128 => Ok(random_symmetric(algorithm, 16)),
            KeyAlgorithm::Aes192 => Ok(random_symmetric(algorithm, 24)),
            KeyAlgorithm::Aes256 | KeyAlgorithm::Hmac256 => {
                Ok(random_symmetric(algorithm, BARRIER_KEY_LEN))
            }
            KeyAlgorithm::Rsa2048 => generate_rsa(algorithm, 2048),
            KeyAlgorithm::Rsa3072 => generate_rsa(algorithm, 3072),
            KeyAlgorithm::Rsa4096 => generate_rsa(algorithm, 4096),
            KeyAlgorithm::EcP256 => Ok(generate_p256()),
            KeyAlgorithm::Ed25519 => Ok(generate_ed25519()),
            KeyAlgorithm::X25519 => Ok(generate_x25519()),
        }
    }
}

fn random_symmetric(algorithm: KeyAlgorithm, len: usize) -> KeyMaterial {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    KeyMaterial::symmetric(algorithm, SecretBytes::new(bytes))
}

fn generate_rsa(algorithm: KeyAlgorithm, bits: usize) -> Result<KeyMaterial, KeygenError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};

    let failed = |reason: String| KeygenError::Failed { algorithm, reason };

    let private = rsa::RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| failed(e.to_string()))?;
    let private_der = private
        .to_pkcs8_der()
        .map_err(|e| failed(e.to_string()))?;
    let public_der = private
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| failed(e.to_string()))?;

    Ok(KeyMaterial::asymmetric(
        algorithm,
        SecretBytes::from(private_der.as_bytes()),
        public_der.as_bytes().to_vec(),
    ))
}

fn generate_p256() -> KeyMaterial {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    let secret = p256::SecretKey::random(&mut OsRng);
    let public = secret
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();
    KeyMaterial::asymmetric(
        KeyAlgorithm::EcP256,
        SecretBytes::new(secret.to_bytes().to_vec()),
        public,
    )
}

fn generate_ed25519() -> KeyMaterial {
    let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
    KeyMaterial::asymmetric(
        KeyAlgorithm::Ed25519,
        SecretBytes::new(signing.to_bytes().to_vec()),
        signing.verifying_key().to_bytes().to_vec(),
    )
}

fn generate_x25519() -> KeyMaterial {
    let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    KeyMaterial::asymmetric(
        KeyAlgorithm::X25519,
        SecretBytes::new(secret.to_bytes().to_vec()),
        public.as_bytes().to_vec(),
    )
}
