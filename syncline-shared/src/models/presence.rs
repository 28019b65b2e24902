use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A live presence row for one client on one channel, as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Owning client.
    pub client_id: String,
    /// Arbitrary client-provided state (cursor position, display name, ...).
    pub data: Value,
}

/// A presence diff broadcast on `presence:<channelId>`.
///
/// The discriminant is explicit and matched exhaustively; payloads carrying an
/// unknown `type` fail to decode rather than being ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PresenceUpdate {
    /// A client appeared or changed its state.
    #[serde(rename_all = "camelCase")]
    Upsert {
        /// Channel the entry belongs to.
        channel_id: String,
        /// Owning client.
        client_id: String,
        /// New state payload.
        data: Value,
    },
    /// A client's entry expired or was removed.
    #[serde(rename_all = "camelCase")]
    Delete {
        /// Channel the entry belonged to.
        channel_id: String,
        /// Owning client.
        client_id: String,
    },
}

impl PresenceUpdate {
    /// The client the diff is about.
    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::Upsert { client_id, .. } | Self::Delete { client_id, .. } => client_id,
        }
    }

    /// The channel the diff applies to.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Upsert { channel_id, .. } | Self::Delete { channel_id, .. } => channel_id,
        }
    }
}

/// Body of `POST /api/presence/{channelId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpsertRequest {
    /// Client writing its own entry.
    pub client_id: String,
    /// State payload to store and broadcast.
    pub data: Value,
}

/// Body of `POST /api/presence/{channelId}/heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// Client refreshing its own entry.
    pub client_id: String,
}

/// Outcome of a heartbeat. `refreshed: false` means the entry had already
/// expired; the client is expected to re-upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// Whether a live entry was found and refreshed.
    pub refreshed: bool,
}
