//! Application-level payload convention for the raw-artifact topic.
//!
//! An envelope is a JSON object carrying a base64 artifact and an optional
//! media type tag, matching the wire format the gateway and consumer agree
//! on: `{"image": "<base64>", "type": "image/jpeg"}`.
//!
//! Both fields are optional on decode. An envelope without an artifact is
//! a valid, distinct state ("no artifact present") and must not be treated
//! as a decode failure.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Base64-encoded artifact bytes.
    #[serde(rename = "image", skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    /// Media type of the artifact, e.g. "image/jpeg".
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl Envelope {
    pub fn from_artifact(bytes: &[u8], media_type: &str) -> Self {
        Self {
            artifact: Some(BASE64.encode(bytes)),
            media_type: Some(media_type.to_string()),
        }
    }

    /// Serialize for transport as a bus payload.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize envelope")
    }

    /// Parse a bus payload. Fails on malformed JSON, not on a missing
    /// artifact field.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("parse envelope JSON")
    }

    /// Decode the artifact bytes. `Ok(None)` means the envelope carries no
    /// artifact; `Err` means the artifact field is present but not valid
    /// base64.
    pub fn artifact_bytes(&self) -> Result<Option<Vec<u8>>> {
        match &self.artifact {
            Some(encoded) => {
                let bytes = BASE64.decode(encoded).context("decode base64 artifact")?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    pub fn media_type_or_default(&self) -> &str {
        self.media_type.as_deref().unwrap_or(DEFAULT_MEDIA_TYPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_artifact() {
        let env = Envelope::from_artifact(b"jpeg-bytes", "image/jpeg");
        let payload = env.to_payload().expect("encode");
        let parsed = Envelope::from_payload(&payload).expect("decode");
        assert_eq!(parsed.artifact_bytes().expect("base64"), Some(b"jpeg-bytes".to_vec()));
        assert_eq!(parsed.media_type_or_default(), "image/jpeg");
    }

    #[test]
    fn wire_keys_match_convention() {
        let env = Envelope::from_artifact(b"x", "image/png");
        let json = String::from_utf8(env.to_payload().expect("encode")).expect("utf8");
        assert!(json.contains("\"image\""));
        assert!(json.contains("\"type\""));
        assert!(!json.contains("artifact"));
    }

    #[test]
    fn missing_artifact_is_valid_and_distinct() {
        let parsed = Envelope::from_payload(br#"{"note":"no image here"}"#).expect("decode");
        assert_eq!(parsed.artifact_bytes().expect("no artifact"), None);
    }

    #[test]
    fn malformed_json_is_a_decode_failure() {
        assert!(Envelope::from_payload(b"\xff\xfe not json").is_err());
    }

    #[test]
    fn invalid_base64_is_a_decode_failure() {
        let parsed = Envelope::from_payload(br#"{"image":"!!not-base64!!"}"#).expect("decode");
        assert!(parsed.artifact_bytes().is_err());
    }

    #[test]
    fn media_type_defaults_when_absent() {
        let parsed = Envelope::from_payload(br#"{"image":"aGk="}"#).expect("decode");
        assert_eq!(parsed.media_type_or_default(), DEFAULT_MEDIA_TYPE);
    }
}
