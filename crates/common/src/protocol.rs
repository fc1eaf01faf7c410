//! Request and response types exchanged with the barrier admin API.
//!
//! All timestamps are unix milliseconds (UTC). Key identifiers are UUIDs
//! serialised in their hyphenated string form.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Rotation endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /barrier/rotate/{root,intermediate,content}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateRequest {
    /// Human-readable reason recorded with the rotation.
    pub reason: String,
}

/// Response body for root and intermediate rotations.
///
/// The previous key of the tier is retired, so both identifiers are reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateKeyResponse {
    /// Identifier of the key that was active before the rotation (now retired).
    pub old_key_uuid: String,
    /// Identifier of the newly active key.
    pub new_key_uuid: String,
    /// Reason supplied by the caller.
    pub reason: String,
    /// Server-assigned rotation time.
    pub rotated_at: i64,
}

/// Response body for content key rotation.
///
/// Content rotation is elastic: earlier content keys stay active, so there is
/// deliberately no `old_key_uuid` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateContentKeyResponse {
    /// Identifier of the new preferred content key.
    pub new_key_uuid: String,
    /// Reason supplied by the caller.
    pub reason: String,
    /// Server-assigned rotation time.
    pub rotated_at: i64,
}

// ---------------------------------------------------------------------------
// Status endpoints
// ---------------------------------------------------------------------------

/// Identifier and timestamps of one active key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub uuid: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Response body for `GET /barrier/keys/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierKeysStatusResponse {
    pub root_key: KeyStatus,
    pub intermediate_key: KeyStatus,
}

/// Response body for `GET /barrier/keys/content`.
///
/// Ordered oldest first; the last entry is the preferred key for new encryptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKeysStatusResponse {
    pub content_keys: Vec<KeyStatus>,
}

/// One entry of the rotation audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEventResponse {
    /// `"root"`, `"intermediate"` or `"content"`.
    pub tier: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_key_uuid: Option<String>,
    pub new_key_uuid: String,
    pub reason: String,
    pub rotated_at: i64,
}

/// Response body for `GET /barrier/rotations`, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationHistoryResponse {
    pub rotations: Vec<RotationEventResponse>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the barrier has an active root, intermediate and content key.
    pub barrier_ready: bool,
    /// Number of simultaneously active content keys.
    pub active_content_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_rotation_has_no_old_key_field() {
        let resp = RotateContentKeyResponse {
            new_key_uuid: "0190b6c2-0000-7000-8000-000000000001".into(),
            reason: "scheduled".into(),
            rotated_at: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("old_key_uuid").is_none());
        assert_eq!(value["reason"], "scheduled");
    }

    #[test]
    fn rotate_key_response_field_names() {
        let resp = RotateKeyResponse {
            old_key_uuid: "a".into(),
            new_key_uuid: "b".into(),
            reason: "compromise drill".into(),
            rotated_at: 42,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({
                "old_key_uuid": "a",
                "new_key_uuid": "b",
                "reason": "compromise drill",
                "rotated_at": 42
            })
        );
    }

    #[test]
    fn status_response_shape() {
        let status = BarrierKeysStatusResponse {
            root_key: KeyStatus {
                uuid: "r".into(),
                created_at: 1,
                updated_at: 2,
            },
            intermediate_key: KeyStatus {
                uuid: "i".into(),
                created_at: 3,
                updated_at: 4,
            },
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["root_key"]["uuid"], "r");
        assert_eq!(value["intermediate_key"]["updated_at"], 4);
    }

    #[test]
    fn content_event_omits_old_key() {
        let event = RotationEventResponse {
            tier: "content".into(),
            old_key_uuid: None,
            new_key_uuid: "n".into(),
            reason: "r".into(),
            rotated_at: 5,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("old_key_uuid").is_none());
    }

    #[test]
    fn error_response_from_service_error() {
        let err = crate::ServiceError::Unavailable("key material pool exhausted".into());
        let body = ErrorResponse::from(&err);
        assert_eq!(body.code, "service_unavailable");
        assert!(body.message.contains("pool exhausted"));
    }
}
