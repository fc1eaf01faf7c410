//! Key wrap codec: seal and open child material under a parent key.
//!
//! The codec is stateless and side-effect free. It never persists or caches
//! keys; callers supply the parent material and identifier on every call.
//!
//! # Envelope format
//!
//! ```text
//! base64url({"alg":"A256GCMSIV","kid":"<parent uuid>"}) . base64url(nonce) . base64url(ct || tag)
//! ```
//!
//! The same format wraps key material between tiers and application payloads
//! under content keys.

pub mod cipher;
pub mod envelope;

use thiserror::Error;
use uuid::Uuid;

pub use cipher::WrapAlgorithm;
pub use envelope::{Envelope, EnvelopeHeader};

/// Errors produced by the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The envelope is structurally invalid.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope names an algorithm this build does not implement.
    #[error("unsupported wrap algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Authentication failed: wrong key, or the envelope was altered.
    #[error("envelope failed authentication")]
    Integrity,

    /// The key does not have the length the algorithm requires.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encryption failed inside the AEAD implementation.
    #[error("aead operation failed")]
    AeadFailure,
}

/// Seal `child` under `parent`, tagging the envelope with `parent_id`.
///
/// The algorithm is chosen from the parent key length.
pub fn seal(parent_id: Uuid, parent: &[u8], child: &[u8]) -> Result<Envelope, CodecError> {
    seal_with(WrapAlgorithm::for_key_len(parent.len())?, parent_id, parent, child)
}

/// Seal `child` under `parent` with an explicit algorithm.
pub fn seal_with(
    alg: WrapAlgorithm,
    parent_id: Uuid,
    parent: &[u8],
    child: &[u8],
) -> Result<Envelope, CodecError> {
    let header = EnvelopeHeader {
        alg,
        kid: parent_id,
    };
    let protected = Envelope::encode_header(&header)?;
    let (nonce, ciphertext) = alg.seal(parent, protected.as_bytes(), child)?;
    Ok(Envelope::new(header, protected, nonce, ciphertext))
}

/// Open `envelope` with `parent`, returning the child bytes.
///
/// # Errors
///
/// - [`CodecError::Integrity`] on any authentication failure.
/// - [`CodecError::InvalidKeyLength`] if `parent` does not fit the envelope's algorithm.
pub fn open(parent: &[u8], envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    envelope.header().alg.open(
        parent,
        envelope.nonce(),
        envelope.protected().as_bytes(),
        envelope.ciphertext(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    fn key(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn seal_open_round_trip() {
        let parent_id = Uuid::now_v7();
        let parent = key(32, 0x11);
        let env = seal(parent_id, &parent, b"child key material").unwrap();
        assert_eq!(env.kid(), parent_id);
        assert_eq!(env.header().alg, WrapAlgorithm::A256GcmSiv);

        let parsed = Envelope::parse(&env.to_compact()).unwrap();
        assert_eq!(open(&parent, &parsed).unwrap(), b"child key material");
    }

    #[test]
    fn each_algorithm_round_trips() {
        for alg in [
            WrapAlgorithm::A256GcmSiv,
            WrapAlgorithm::A128GcmSiv,
            WrapAlgorithm::C20P,
        ] {
            let parent = key(alg.key_len(), 0x22);
            let env = seal_with(alg, Uuid::now_v7(), &parent, b"payload").unwrap();
            let parsed = Envelope::parse(&env.to_compact()).unwrap();
            assert_eq!(parsed.header().alg, alg);
            assert_eq!(open(&parent, &parsed).unwrap(), b"payload");
        }
    }

    #[test]
    fn empty_child_round_trips() {
        let parent = key(32, 0x33);
        let env = seal(Uuid::now_v7(), &parent, b"").unwrap();
        assert!(open(&parent, &env).unwrap().is_empty());
    }

    #[test]
    fn wrong_parent_fails_integrity() {
        let env = seal(Uuid::now_v7(), &key(32, 1), b"secret").unwrap();
        assert!(matches!(open(&key(32, 2), &env), Err(CodecError::Integrity)));
    }

    #[test]
    fn every_tag_byte_is_authenticated() {
        let parent = key(32, 0x44);
        let env = seal(Uuid::now_v7(), &parent, b"tamper me").unwrap();
        let len = env.ciphertext().len();
        for i in len - cipher::TAG_LEN..len {
            let mut tampered = env.clone();
            tampered.ciphertext_mut()[i] ^= 0x01;
            assert!(
                matches!(open(&parent, &tampered), Err(CodecError::Integrity)),
                "flip at byte {i} was not detected"
            );
        }
    }

    #[test]
    fn rewritten_kid_fails_integrity() {
        let parent = key(32, 0x55);
        let env = seal(Uuid::now_v7(), &parent, b"bound header").unwrap();
        let compact = env.to_compact();
        let (_, rest) = compact.split_once('.').unwrap();

        let forged_header = URL_SAFE_NO_PAD.encode(format!(
            r#"{{"alg":"A256GCMSIV","kid":"{}"}}"#,
            Uuid::now_v7()
        ));
        let forged = Envelope::parse(&format!("{forged_header}.{rest}")).unwrap();
        assert!(matches!(open(&parent, &forged), Err(CodecError::Integrity)));
    }

    #[test]
    fn unsupported_parent_length() {
        let err = seal(Uuid::now_v7(), &key(24, 0), b"x").unwrap_err();
        assert!(matches!(err, CodecError::InvalidKeyLength { actual: 24, .. }));
    }
}
