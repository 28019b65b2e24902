use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use utoipa::ToSchema;

/// The wire envelope every live update travels in.
///
/// `client_id` names the originating connection so the relay can skip echoing
/// the payload back to it; `null` marks a server-originated or
/// non-attributable update, which is delivered to everyone. The domain
/// messages themselves are opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    /// Originating connection, if attributable. Serialized as an explicit
    /// `null` when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Domain payloads (chat rows, presence diffs, ...) in delivery order.
    pub domain_messages: Vec<Value>,
}

impl UpdateEnvelope {
    /// Envelope attributed to `client_id`.
    #[must_use]
    pub fn new(client_id: Option<String>, domain_messages: Vec<Value>) -> Self {
        Self {
            client_id,
            domain_messages,
        }
    }

    /// Non-attributable envelope, delivered to every subscriber.
    #[must_use]
    pub fn server(domain_messages: Vec<Value>) -> Self {
        Self::new(None, domain_messages)
    }

    /// Serializes typed domain messages into an envelope.
    ///
    /// # Errors
    /// Returns a serialization error if an item cannot be represented as JSON.
    pub fn encode<T: Serialize>(
        client_id: Option<String>,
        items: &[T],
    ) -> serde_json::Result<Self> {
        let domain_messages = items
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        Ok(Self::new(client_id, domain_messages))
    }

    /// Decodes every domain message as `T`, failing on the first mismatch.
    ///
    /// # Errors
    /// Returns a deserialization error if any item does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<Vec<T>> {
        self.domain_messages
            .iter()
            .map(|value| serde_json::from_value(value.clone()))
            .collect()
    }

    /// Whether delivery to the stream registered under `recipient` must be
    /// skipped. Only an exact `clientId` match suppresses; envelopes without
    /// an origin and streams without a `clientId` are always delivered.
    #[must_use]
    pub fn suppresses(&self, recipient: Option<&str>) -> bool {
        match (self.client_id.as_deref(), recipient) {
            (Some(origin), Some(recipient)) => origin == recipient,
            _ => false,
        }
    }

    /// The broker payload for this envelope.
    ///
    /// # Errors
    /// Returns a serialization error if the envelope cannot be rendered.
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses a broker payload back into an envelope.
    ///
    /// # Errors
    /// Returns a deserialization error for malformed payloads.
    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}
