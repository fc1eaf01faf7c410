//! AEAD algorithms an envelope may name, and the dispatch between them.
//!
//! AES-GCM-SIV (RFC 8452) is used for everything the barrier seals.
//! ChaCha20-Poly1305 envelopes are accepted on open.

use std::{fmt, str::FromStr};

use rand::{rngs::OsRng, RngCore};

use super::CodecError;

/// Byte length of every supported AEAD nonce (96 bits).
pub const NONCE_LEN: usize = 12;

/// Authentication tag length shared by every supported algorithm.
pub const TAG_LEN: usize = 16;

/// Wrap algorithms this build implements, keyed by their header tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapAlgorithm {
    /// AES-256-GCM-SIV, 32-byte keys.
    A256GcmSiv,
    /// AES-128-GCM-SIV, 16-byte keys.
    A128GcmSiv,
    /// ChaCha20-Poly1305, 32-byte keys.
    C20P,
}

impl WrapAlgorithm {
    /// Header tag written into the `alg` field.
    pub fn tag(&self) -> &'static str {
        match self {
            WrapAlgorithm::A256GcmSiv => "A256GCMSIV",
            WrapAlgorithm::A128GcmSiv => "A128GCMSIV",
            WrapAlgorithm::C20P => "C20P",
        }
    }

    /// Required key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            WrapAlgorithm::A256GcmSiv | WrapAlgorithm::C20P => 32,
            WrapAlgorithm::A128GcmSiv => 16,
        }
    }

    /// Default algorithm for a parent key of `len` bytes.
    pub fn for_key_len(len: usize) -> Result<Self, CodecError> {
        match len {
            32 => Ok(WrapAlgorithm::A256GcmSiv),
            16 => Ok(WrapAlgorithm::A128GcmSiv),
            actual => Err(CodecError::InvalidKeyLength {
                expected: 32,
                actual,
            }),
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<(), CodecError> {
        if key.len() != self.key_len() {
            return Err(CodecError::InvalidKeyLength {
                expected: self.key_len(),
                actual: key.len(),
            });
        }
        Ok(())
    }

    /// Encrypt `plaintext` under `key`, authenticating `aad`.
    ///
    /// Returns the fresh random nonce and `ciphertext || tag`.
    pub(crate) fn seal(
        &self,
        key: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<([u8; NONCE_LEN], Vec<u8>), CodecError> {
        self.check_key(key)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = match self {
            WrapAlgorithm::A256GcmSiv => {
                use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
                let cipher = aes_gcm_siv::Aes256GcmSiv::new_from_slice(key)
                    .map_err(|_| CodecError::AeadFailure)?;
                cipher.encrypt(
                    aes_gcm_siv::Nonce::from_slice(&nonce),
                    Payload { msg: plaintext, aad },
                )
            }
            WrapAlgorithm::A128GcmSiv => {
                use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
                let cipher = aes_gcm_siv::Aes128GcmSiv::new_from_slice(key)
                    .map_err(|_| CodecError::AeadFailure)?;
                cipher.encrypt(
                    aes_gcm_siv::Nonce::from_slice(&nonce),
                    Payload { msg: plaintext, aad },
                )
            }
            WrapAlgorithm::C20P => {
                use chacha20poly1305::aead::{Aead, KeyInit, Payload};
                let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| CodecError::AeadFailure)?;
                cipher.encrypt(
                    chacha20poly1305::Nonce::from_slice(&nonce),
                    Payload { msg: plaintext, aad },
                )
            }
        }
        .map_err(|_| CodecError::AeadFailure)?;

        Ok((nonce, sealed))
    }

    /// Decrypt and authenticate `sealed` (`ciphertext || tag`).
    ///
    /// Any authentication failure, including a wrong key, is reported as
    /// [`CodecError::Integrity`].
    pub(crate) fn open(
        &self,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        self.check_key(key)?;

        match self {
            WrapAlgorithm::A256GcmSiv => {
                use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
                let cipher = aes_gcm_siv::Aes256GcmSiv::new_from_slice(key)
                    .map_err(|_| CodecError::AeadFailure)?;
                cipher.decrypt(
                    aes_gcm_siv::Nonce::from_slice(nonce),
                    Payload { msg: sealed, aad },
                )
            }
            WrapAlgorithm::A128GcmSiv => {
                use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
                let cipher = aes_gcm_siv::Aes128GcmSiv::new_from_slice(key)
                    .map_err(|_| CodecError::AeadFailure)?;
                cipher.decrypt(
                    aes_gcm_siv::Nonce::from_slice(nonce),
                    Payload { msg: sealed, aad },
                )
            }
            WrapAlgorithm::C20P => {
                use chacha20poly1305::aead::{Aead, KeyInit, Payload};
                let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| CodecError::AeadFailure)?;
                cipher.decrypt(
                    chacha20poly1305::Nonce::from_slice(nonce),
                    Payload { msg: sealed, aad },
                )
            }
        }
        .map_err(|_| CodecError::Integrity)
    }
}

impl fmt::Display for WrapAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for WrapAlgorithm {
    type Err = CodecError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "A256GCMSIV" => Ok(WrapAlgorithm::A256GcmSiv),
            "A128GCMSIV" => Ok(WrapAlgorithm::A128GcmSiv),
            "C20P" => Ok(WrapAlgorithm::C20P),
            other => Err(CodecError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}
