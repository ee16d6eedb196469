//! The JSON wrapper every backend puts on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportError;

/// Hard payload limit of PostgreSQL `NOTIFY`
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// `{ "data": <payload>, "tenantId": string|null, "timestamp": ISO-8601 }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub data: Value,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(data: Value, tenant_id: Option<&str>) -> Self {
        Self {
            data,
            tenant_id: tenant_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Encode, refusing anything whose serialized form exceeds `limit` bytes.
    pub fn encode_bounded(&self, limit: usize) -> Result<String, TransportError> {
        let encoded = self.encode()?;
        if encoded.len() > limit {
            return Err(TransportError::EnvelopeTooLarge {
                size: encoded.len(),
                limit,
            });
        }
        Ok(encoded)
    }

    pub fn decode(raw: &str) -> Result<Self, TransportError> {
        serde_json::from_str(raw).map_err(|e| TransportError::Decode(e.to_string()))
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let envelope = Envelope::new(json!({"boardId": "b1"}), Some("t1"));
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["data"]["boardId"], "b1");
        assert_eq!(value["tenantId"], "t1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_single_tenant_serializes_null() {
        let envelope = Envelope::new(json!({}), None);
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert!(value["tenantId"].is_null());
    }

    #[test]
    fn test_bounded_accepts_at_limit() {
        let envelope = Envelope::new(json!({"k": "v"}), None);
        let size = envelope.encode().unwrap().len();
        assert!(envelope.encode_bounded(size).is_ok());
    }

    #[test]
    fn test_bounded_rejects_over_limit() {
        let envelope = Envelope::new(json!({"blob": "x".repeat(9000)}), Some("t1"));
        match envelope.encode_bounded(NOTIFY_PAYLOAD_LIMIT) {
            Err(TransportError::EnvelopeTooLarge { size, limit }) => {
                assert!(size > 9000);
                assert_eq!(limit, NOTIFY_PAYLOAD_LIMIT);
            }
            other => panic!("expected EnvelopeTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode("{\"data\":"),
            Err(TransportError::Decode(_))
        ));
        assert!(Envelope::decode("{\"tenantId\":\"t1\"}").is_err());
    }

    #[test]
    fn test_decode_without_tenant_field() {
        let envelope =
            Envelope::decode(r#"{"data":{"a":1},"timestamp":"2026-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(envelope.tenant(), None);
        assert_eq!(envelope.data["a"], 1);
    }
}
