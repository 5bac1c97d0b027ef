//! Persisted state layout.
//!
//! A state document is written as `{ "format", "checksum", "payload" }`. The
//! checksum is the SHA-256 of the canonical JSON of the payload (object keys
//! sorted), so whitespace changes to the file do not invalidate it but any
//! edit to the content does.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigHasher;
use crate::error::{Result, StateError};

use super::types::{StateDocument, STATE_VERSION};

/// Format marker written into every envelope.
pub const STATE_FORMAT: &str = "converge-state";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    checksum: String,
    payload: Value,
}

/// Serializes a document into its checksummed envelope.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn encode(doc: &StateDocument) -> Result<String> {
    let payload = serde_json::to_value(doc)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
    let checksum = checksum_of(&payload)?;

    let envelope = Envelope {
        format: STATE_FORMAT.to_string(),
        checksum,
        payload,
    };

    serde_json::to_string_pretty(&envelope)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
}

/// Parses and validates an envelope.
///
/// # Errors
///
/// Returns [`StateError::Corrupted`] when the envelope, checksum or schema is
/// invalid, and [`StateError::VersionMismatch`] for documents from a newer
/// schema.
pub fn decode(key: &str, content: &str) -> Result<StateDocument> {
    let envelope: Envelope = serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(key, format!("Failed to parse state file: {e}")))?;

    if envelope.format != STATE_FORMAT {
        return Err(StateError::corrupted(
            key,
            format!("Unexpected format marker '{}'", envelope.format),
        )
        .into());
    }

    let actual = checksum_of(&envelope.payload)?;
    if !ConfigHasher::hashes_match(&actual, &envelope.checksum) {
        return Err(StateError::corrupted(key, "Checksum mismatch").into());
    }

    let found = envelope
        .payload
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| StateError::corrupted(key, "Missing state version"))?;
    if found > u64::from(STATE_VERSION) {
        return Err(StateError::VersionMismatch {
            expected: STATE_VERSION,
            found: u32::try_from(found).unwrap_or(u32::MAX),
        }
        .into());
    }

    serde_json::from_value(envelope.payload)
        .map_err(|e| StateError::corrupted(key, format!("Invalid state schema: {e}")).into())
}

fn checksum_of(payload: &Value) -> Result<String> {
    let canonical = serde_json::to_vec(payload)
        .map_err(|e| StateError::serialization(format!("Failed to canonicalize state: {e}")))?;
    Ok(ConfigHasher::checksum(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceId;
    use crate::error::ConvergeError;
    use crate::state::{ResourceState, StateUpdate};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample() -> StateDocument {
        let mut doc = StateDocument::new();
        let id = ResourceId::new("null_resource", "vnet");
        doc.apply_updates(BTreeMap::from([(
            id.clone(),
            StateUpdate::Put(ResourceState::new(
                id,
                BTreeMap::from([(String::from("cidr"), json!("10.0.0.0/16"))]),
                BTreeMap::new(),
            )),
        )]));
        doc
    }

    #[test]
    fn test_encode_decode() {
        let doc = sample();
        let decoded = decode("k", &encode(&doc).unwrap()).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn test_whitespace_does_not_matter() {
        let encoded = encode(&sample()).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        let compact = serde_json::to_string(&value).unwrap();

        assert!(decode("k", &compact).is_ok());
    }

    #[test]
    fn test_tampering_detected() {
        let encoded = encode(&sample()).unwrap();
        let tampered = encoded.replace("10.0.0.0/16", "10.9.0.0/16");

        let err = decode("k", &tampered).unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let err = decode("k", "not json").unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut payload = serde_json::to_value(sample()).unwrap();
        payload["version"] = json!(STATE_VERSION + 1);
        let checksum = checksum_of(&payload).unwrap();
        let content = json!({
            "format": STATE_FORMAT,
            "checksum": checksum,
            "payload": payload,
        })
        .to_string();

        let err = decode("k", &content).unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::VersionMismatch { .. })));
    }
}
