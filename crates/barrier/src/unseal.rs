//! Unseal bootstrap: turns an operator-supplied secret into the key that
//! seals root records.
//!
//! # Security invariants
//!
//! - The secret and the derived key are zeroed on drop and never logged.
//! - The same secret always derives the same key and the same key id, so a
//!   restarted process can open the root records it wrote before.

use std::{fmt, path::PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::material::{SecretBytes, BARRIER_KEY_LEN};

/// Shortest accepted unseal secret.
pub const MIN_SECRET_LEN: usize = 32;

/// Longest accepted unseal secret.
pub const MAX_SECRET_LEN: usize = 512;

const HKDF_SALT: &[u8] = b"barrier/unseal/v1";
const HKDF_INFO: &[u8] = b"barrier root wrapping key";
const FINGERPRINT_LABEL: &[u8] = b"barrier/unseal/kid/v1";

/// Namespace for unseal key ids (UUIDv5).
const KID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8e25_b1c4_7d9e_3a60);

/// Errors produced while obtaining or deriving the unseal key.
#[derive(Debug, Error)]
pub enum UnsealError {
    /// The provider has no secret to give (unset variable, missing file).
    #[error("unseal secret unavailable: {0}")]
    Unavailable(String),

    /// The secret exists but cannot be decoded.
    #[error("unseal secret is not valid: {0}")]
    Invalid(String),

    /// The secret is outside the accepted length range.
    #[error("unseal secret must be {MIN_SECRET_LEN}..={MAX_SECRET_LEN} bytes, got {0}")]
    InvalidLength(usize),

    /// Key derivation failed.
    #[error("unseal key derivation failed")]
    Derivation,
}

/// Source of the unseal secret.
pub trait UnsealSecretProvider: Send + Sync {
    /// Return the raw secret bytes.
    fn secret(&self) -> Result<SecretBytes, UnsealError>;
}

/// Reads a base64-encoded secret from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl UnsealSecretProvider for EnvSecretProvider {
    fn secret(&self) -> Result<SecretBytes, UnsealError> {
        let encoded = std::env::var(&self.var)
            .map_err(|_| UnsealError::Unavailable(format!("environment variable {} is not set", self.var)))?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| UnsealError::Invalid(format!("{} is not base64: {e}", self.var)))?;
        Ok(SecretBytes::new(bytes))
    }
}

/// Reads raw secret bytes from a file.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    path: PathBuf,
}

impl FileSecretProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UnsealSecretProvider for FileSecretProvider {
    fn secret(&self) -> Result<SecretBytes, UnsealError> {
        std::fs::read(&self.path)
            .map(SecretBytes::new)
            .map_err(|e| UnsealError::Unavailable(format!("{}: {e}", self.path.display())))
    }
}

/// Fixed in-memory secret, for tests and embedding.
#[derive(Debug, Clone)]
pub struct StaticSecretProvider(SecretBytes);

impl StaticSecretProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(SecretBytes::new(secret.into()))
    }
}

impl UnsealSecretProvider for StaticSecretProvider {
    fn secret(&self) -> Result<SecretBytes, UnsealError> {
        Ok(self.0.clone())
    }
}

/// Key that seals root records, with its deterministic identifier.
#[derive(Clone)]
pub struct UnsealKey {
    id: Uuid,
    key: SecretBytes,
}

impl fmt::Debug for UnsealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealKey")
            .field("id", &self.id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl UnsealKey {
    /// Derive the unseal key from `secret` with HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// [`UnsealError::InvalidLength`] if the secret is shorter than
    /// [`MIN_SECRET_LEN`] or longer than [`MAX_SECRET_LEN`].
    pub fn derive(secret: &[u8]) -> Result<Self, UnsealError> {
        if !(MIN_SECRET_LEN..=MAX_SECRET_LEN).contains(&secret.len()) {
            return Err(UnsealError::InvalidLength(secret.len()));
        }

        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret);
        let mut okm = vec![0u8; BARRIER_KEY_LEN];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|_| UnsealError::Derivation)?;
        let key = SecretBytes::new(okm);

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
            .map_err(|_| UnsealError::Derivation)?;
        mac.update(FINGERPRINT_LABEL);
        let fingerprint = mac.finalize().into_bytes();
        let id = Uuid::new_v5(&KID_NAMESPACE, &fingerprint);

        Ok(Self { id, key })
    }

    /// Fetch the secret from `provider` and derive the key.
    pub fn from_provider(provider: &dyn UnsealSecretProvider) -> Result<Self, UnsealError> {
        let secret = provider.secret()?;
        Self::derive(secret.as_bytes())
    }

    /// Identifier written into the header of every root envelope.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn material(&self) -> &[u8] {
        self.key.as_bytes()
    }
}
