//! Bus wire protocol
//!
//! One [`Envelope`] per bus operation. Envelopes are JSON on the wire:
//! `{type, topic, correlationId?, metadata?, params[], error?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::module::bus::error::BusError;
use crate::module::bus::listeners::{ChangeKind, SubscriberChange};
use crate::module::bus::scope::AccessScope;

/// Correlation ID for matching requests with responses
pub type CorrelationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeType {
    Event,
    Request,
    Response,
    AddEventListener,
    RemoveEventListener,
    AddRequestListener,
    RemoveRequestListener,
    AddEventSubscriberListener,
    RemoveEventSubscriberListener,
    /// Coordinator to worker: an event listener was added or removed
    EventSubscriberChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Call metadata on events and requests, the filter on registrations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AccessScope>,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BusError>,
}

impl Envelope {
    fn new(kind: EnvelopeType, topic: &str) -> Self {
        Self {
            kind,
            topic: topic.to_string(),
            correlation_id: None,
            metadata: None,
            params: Vec::new(),
            error: None,
        }
    }

    pub fn event(topic: &str, metadata: AccessScope, params: Vec<Value>) -> Self {
        Self {
            metadata: Some(metadata),
            params,
            ..Self::new(EnvelopeType::Event, topic)
        }
    }

    pub fn request(
        topic: &str,
        correlation_id: CorrelationId,
        metadata: AccessScope,
        params: Vec<Value>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            metadata: Some(metadata),
            params,
            ..Self::new(EnvelopeType::Request, topic)
        }
    }

    pub fn response(
        topic: &str,
        correlation_id: CorrelationId,
        result: Result<Value, BusError>,
    ) -> Self {
        let mut envelope = Self {
            correlation_id: Some(correlation_id),
            ..Self::new(EnvelopeType::Response, topic)
        };
        match result {
            Ok(value) => envelope.params.push(value),
            Err(error) => envelope.error = Some(error),
        }
        envelope
    }

    /// Add/remove of an event or request listener
    pub fn registration(kind: EnvelopeType, topic: &str, filter: AccessScope) -> Self {
        Self {
            metadata: Some(filter),
            ..Self::new(kind, topic)
        }
    }

    /// Add/remove of a subscriber listener; these carry no filter
    pub fn subscriber_registration(kind: EnvelopeType, topic: &str) -> Self {
        Self::new(kind, topic)
    }

    pub fn subscriber_changed(change: &SubscriberChange) -> Self {
        Self {
            metadata: Some(change.filter.clone()),
            params: vec![
                Value::String(change.kind.as_str().to_string()),
                Value::from(change.listeners),
            ],
            ..Self::new(EnvelopeType::EventSubscriberChanged, &change.topic)
        }
    }

    /// Reads a subscriber notification back out of an envelope
    pub fn to_subscriber_change(&self) -> Option<SubscriberChange> {
        let kind = ChangeKind::parse(self.params.first()?.as_str()?)?;
        let listeners = usize::try_from(self.params.get(1)?.as_u64()?).ok()?;
        Some(SubscriberChange {
            topic: self.topic.clone(),
            kind,
            filter: self.metadata.clone().unwrap_or_default(),
            listeners,
        })
    }

    /// Result carried by a response envelope
    pub fn into_result(self) -> Result<Value, BusError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.params.into_iter().next().unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let envelope = Envelope::request("math.add", 42, AccessScope::scoped(["calc"]), vec![json!(1), json!(2)]);
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "request",
                "topic": "math.add",
                "correlationId": 42,
                "metadata": {"scopes": ["calc"]},
                "params": [1, 2]
            })
        );
    }

    #[test]
    fn test_response_error_survives_wire() {
        let envelope = Envelope::response(
            "math.add",
            7,
            Err(BusError::Permissions {
                topic: "math.add".to_string(),
            }),
        );
        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(wire.contains("\"reason\":\"PERMISSIONS\""));
        let decoded: Envelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded.kind, EnvelopeType::Response);
        assert_eq!(
            decoded.into_result(),
            Err(BusError::Permissions {
                topic: "math.add".to_string()
            })
        );
    }

    #[test]
    fn test_registration_type_names() {
        let envelope = Envelope::subscriber_registration(
            EnvelopeType::AddEventSubscriberListener,
            "ui.items",
        );
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "addEventSubscriberListener");
        assert_eq!(wire["params"], json!([]));
    }

    #[test]
    fn test_missing_params_default_to_empty() {
        let decoded: Envelope =
            serde_json::from_str(r#"{"type":"event","topic":"t"}"#).unwrap();
        assert!(decoded.params.is_empty());
        assert!(decoded.metadata.is_none());
    }

    #[test]
    fn test_subscriber_change_roundtrip() {
        let change = SubscriberChange {
            topic: "ui.items".to_string(),
            kind: ChangeKind::Removed,
            filter: AccessScope::for_user("alice"),
            listeners: 3,
        };
        let envelope = Envelope::subscriber_changed(&change);
        assert_eq!(envelope.to_subscriber_change(), Some(change));
    }
}
