//! Versioned envelope for persisted documents.
//!
//! Every document written to the shared store (run records, snapshots) is
//! wrapped in a version header so that record shapes can evolve across
//! rolling deployments. Readers check the version before trusting the
//! payload; a reader that encounters a newer version than it understands
//! fails loudly instead of silently misreading.

use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// Error produced when decoding an envelope fails.
#[derive(Debug)]
pub enum EnvelopeError {
    /// The bytes were not a valid envelope or payload.
    Malformed { message: String },
    /// The envelope's version is not the current one.
    VersionMismatch { found: u32, expected: u32 },
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { message } => write!(f, "malformed envelope: {message}"),
            Self::VersionMismatch { found, expected } => {
                write!(f, "envelope version {found} (expected {expected})")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// A versioned envelope wrapping a persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Returns true if this envelope uses the current version.
    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed {
            message: e.to_string(),
        })
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Decodes an envelope from JSON, requiring the current version.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the envelope carries a
    /// different version.
    pub fn decode_current(raw: &str) -> Result<T, EnvelopeError> {
        let raw_envelope = RawEnvelope::decode(raw)?;
        if raw_envelope.version != CURRENT_VERSION {
            return Err(EnvelopeError::VersionMismatch {
                found: raw_envelope.version,
                expected: CURRENT_VERSION,
            });
        }
        let envelope: Envelope<T> = raw_envelope.deserialize_payload()?;
        Ok(envelope.payload)
    }
}

/// An envelope whose payload has not been deserialized yet.
///
/// Useful when the version must be inspected before committing to a payload
/// shape, e.g. during a version migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope {
    /// The version of the envelope format.
    pub version: u32,
    /// The raw payload (not yet deserialized).
    pub payload: serde_json::Value,
}

impl RawEnvelope {
    /// Decodes the envelope shell from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not an envelope.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed {
            message: e.to_string(),
        })
    }

    /// Attempts to deserialize the payload into the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be deserialized into `T`.
    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(
        self,
    ) -> Result<Envelope<T>, EnvelopeError> {
        let payload: T =
            serde_json::from_value(self.payload).map_err(|e| EnvelopeError::Malformed {
                message: e.to_string(),
            })?;
        Ok(Envelope {
            version: self.version,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestPayload {
        message: String,
        count: u32,
    }

    #[test]
    fn encode_decode_roundtrip() {
        let envelope = Envelope::new(TestPayload {
            message: "hello".to_string(),
            count: 42,
        });
        assert!(envelope.is_current_version());

        let raw = envelope.encode().expect("encode");
        let payload: TestPayload = Envelope::decode_current(&raw).expect("decode");
        assert_eq!(payload, envelope.into_payload());
    }

    #[test]
    fn decode_rejects_future_version() {
        let raw = format!(
            r#"{{"version":{},"payload":{{"message":"x","count":1}}}}"#,
            CURRENT_VERSION + 1
        );
        let result: Result<TestPayload, _> = Envelope::decode_current(&raw);
        assert!(matches!(
            result,
            Err(EnvelopeError::VersionMismatch { found, .. }) if found == CURRENT_VERSION + 1
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        let result: Result<TestPayload, _> = Envelope::decode_current("not json");
        assert!(matches!(result, Err(EnvelopeError::Malformed { .. })));
    }

    #[test]
    fn raw_envelope_exposes_version_before_payload() {
        let raw = r#"{"version":1,"payload":{"message":"lazy","count":7}}"#;
        let shell = RawEnvelope::decode(raw).expect("decode shell");
        assert_eq!(shell.version, 1);
        let typed: Envelope<TestPayload> = shell.deserialize_payload().expect("payload");
        assert_eq!(typed.payload.count, 7);
    }
}
