//! Compact envelope serialisation.
//!
//! ```text
//! base64url(header-json) . base64url(nonce) . base64url(ciphertext || tag)
//! ```
//!
//! The encoded header segment is the AEAD associated data, so the `alg` and
//! `kid` fields are covered by the authentication tag.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    cipher::{WrapAlgorithm, NONCE_LEN, TAG_LEN},
    CodecError,
};

#[derive(Debug, Serialize, Deserialize)]
struct RawHeader {
    alg: String,
    kid: Uuid,
}

/// Parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Algorithm used to seal the payload.
    pub alg: WrapAlgorithm,
    /// Identifier of the key the payload is sealed under.
    pub kid: Uuid,
}

/// An authenticated, self-describing ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    header: EnvelopeHeader,
    /// Encoded header segment exactly as it appeared on the wire (the AAD).
    protected: String,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl Envelope {
    pub(crate) fn encode_header(header: &EnvelopeHeader) -> Result<String, CodecError> {
        let raw = RawHeader {
            alg: header.alg.tag().to_owned(),
            kid: header.kid,
        };
        let json = serde_json::to_vec(&raw)
            .map_err(|e| CodecError::Malformed(format!("header serialisation: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub(crate) fn new(
        header: EnvelopeHeader,
        protected: String,
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            header,
            protected,
            nonce,
            ciphertext,
        }
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// Identifier of the key this envelope is sealed under.
    pub fn kid(&self) -> Uuid {
        self.header.kid
    }

    pub(crate) fn protected(&self) -> &str {
        &self.protected
    }

    pub(crate) fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Ciphertext followed by the authentication tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Mutable access to the sealed bytes, for corruption tests.
    #[cfg(test)]
    pub(crate) fn ciphertext_mut(&mut self) -> &mut Vec<u8> {
        &mut self.ciphertext
    }

    /// Encode to the canonical compact string.
    pub fn to_compact(&self) -> String {
        format!(
            "{}.{}.{}",
            self.protected,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }

    /// Parse a compact envelope.
    ///
    /// # Errors
    ///
    /// - [`CodecError::Malformed`] if the structure, base64, JSON or kid is invalid.
    /// - [`CodecError::UnsupportedAlgorithm`] if `alg` names an algorithm this
    ///   build does not implement.
    pub fn parse(s: &str) -> Result<Self, CodecError> {
        let mut parts = s.split('.');
        let (protected, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(n), Some(c), None) => (h, n, c),
            _ => return Err(CodecError::Malformed("expected three segments".into())),
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(protected)
            .map_err(|_| CodecError::Malformed("header is not base64url".into()))?;
        let raw: RawHeader = serde_json::from_slice(&header_json)
            .map_err(|e| CodecError::Malformed(format!("header: {e}")))?;
        let alg: WrapAlgorithm = raw.alg.parse()?;

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| CodecError::Malformed("nonce is not base64url".into()))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CodecError::Malformed(format!("nonce must be {NONCE_LEN} bytes")))?;

        let ciphertext = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|_| CodecError::Malformed("ciphertext is not base64url".into()))?;
        if ciphertext.len() < TAG_LEN {
            return Err(CodecError::Malformed("ciphertext shorter than tag".into()));
        }

        Ok(Self {
            header: EnvelopeHeader { alg, kid: raw.kid },
            protected: protected.to_owned(),
            nonce,
            ciphertext,
        })
    }

    /// Parse a compact envelope from raw bytes.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| CodecError::Malformed("envelope is not UTF-8".into()))?;
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_segment(json: &str) -> String {
        URL_SAFE_NO_PAD.encode(json)
    }

    fn body() -> String {
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode([0u8; NONCE_LEN]),
            URL_SAFE_NO_PAD.encode([0u8; TAG_LEN + 4])
        )
    }

    #[test]
    fn parses_well_formed_envelope() {
        let kid = Uuid::now_v7();
        let s = format!(
            "{}.{}",
            header_segment(&format!(r#"{{"alg":"C20P","kid":"{kid}"}}"#)),
            body()
        );
        let env = Envelope::parse(&s).unwrap();
        assert_eq!(env.kid(), kid);
        assert_eq!(env.header().alg, WrapAlgorithm::C20P);
        assert_eq!(env.to_compact(), s);
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(matches!(Envelope::parse("a.b"), Err(CodecError::Malformed(_))));
        assert!(matches!(Envelope::parse("a.b.c.d"), Err(CodecError::Malformed(_))));
        assert!(matches!(Envelope::parse(""), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn rejects_bad_base64_header() {
        let s = format!("!!!.{}", body());
        assert!(matches!(Envelope::parse(&s), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn rejects_non_uuid_kid() {
        let s = format!("{}.{}", header_segment(r#"{"alg":"A256GCMSIV","kid":"root"}"#), body());
        assert!(matches!(Envelope::parse(&s), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn unknown_alg_is_unsupported_not_malformed() {
        let s = format!(
            "{}.{}",
            header_segment(&format!(r#"{{"alg":"RSA-OAEP","kid":"{}"}}"#, Uuid::now_v7())),
            body()
        );
        assert!(matches!(
            Envelope::parse(&s),
            Err(CodecError::UnsupportedAlgorithm(ref t)) if t == "RSA-OAEP"
        ));
    }

    #[test]
    fn rejects_short_nonce_and_ciphertext() {
        let header = header_segment(&format!(r#"{{"alg":"A256GCMSIV","kid":"{}"}}"#, Uuid::now_v7()));
        let short_nonce = format!(
            "{header}.{}.{}",
            URL_SAFE_NO_PAD.encode([0u8; 8]),
            URL_SAFE_NO_PAD.encode([0u8; 32])
        );
        assert!(matches!(Envelope::parse(&short_nonce), Err(CodecError::Malformed(_))));

        let short_ct = format!(
            "{header}.{}.{}",
            URL_SAFE_NO_PAD.encode([0u8; NONCE_LEN]),
            URL_SAFE_NO_PAD.encode([0u8; 4])
        );
        assert!(matches!(Envelope::parse(&short_ct), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn rejects_non_utf8_bytes() {
        assert!(matches!(
            Envelope::parse_bytes(&[0xff, 0xfe, b'.']),
            Err(CodecError::Malformed(_))
        ));
    }
}
