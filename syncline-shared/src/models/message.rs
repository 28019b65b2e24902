use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::timestamp::Timestamp;

/// A chat message row as stored and broadcast.
///
/// `chat_sequence_id` orders the conversation and is assigned exactly once,
/// at first write. `message_sequence_id` is the edit version for this
/// `message_id`, starting at 0 and incremented on every upsert. Deletes are
/// tombstones (`is_deleted`), never physical removals, so conversation
/// sequence numbers stay dense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique message identifier.
    pub message_id: String,
    /// Conversation this message belongs to.
    pub chat_id: String,
    /// Dense conversation-order sequence, unique per chat.
    pub chat_sequence_id: i64,
    /// Edit version, starting at 0.
    pub message_sequence_id: i64,
    /// Instant of first write.
    pub created_at: Timestamp,
    /// Message body; absent on tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tombstone flag; a deleted row keeps its sequence slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
    /// Client-only marker for not-yet-acknowledged local edits. Never set on
    /// rows the server produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_optimistic: Option<bool>,
}

impl Message {
    /// Whether this row is a tombstone.
    #[must_use]
    pub fn tombstoned(&self) -> bool {
        self.is_deleted == Some(true)
    }

    /// Whether this row is a pending local edit.
    #[must_use]
    pub fn optimistic(&self) -> bool {
        self.is_optimistic == Some(true)
    }

    /// Builds the authoritative row broadcast after a successful upsert:
    /// request fields plus server-assigned sequencing, optimistic flag off.
    #[must_use]
    pub fn authoritative(
        chat_id: impl Into<String>,
        upsert: &MessageUpsert,
        receipt: &UpsertReceipt,
    ) -> Self {
        Self {
            message_id: upsert.message_id.clone(),
            chat_id: chat_id.into(),
            chat_sequence_id: receipt.chat_sequence_id,
            message_sequence_id: receipt.message_sequence_id,
            created_at: receipt.created_at,
            text: upsert.text.clone(),
            is_deleted: upsert.is_deleted,
            is_optimistic: None,
        }
    }
}

/// Write request for a message: new text, or a tombstone flag, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpsert {
    /// Globally unique message identifier chosen by the writer.
    pub message_id: String,
    /// Identifier of the writing connection; used for echo suppression when
    /// the resulting row is broadcast. Absent means non-attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Replacement text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tombstone flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
}

impl MessageUpsert {
    /// An upsert that carries neither text nor a tombstone flag does nothing
    /// and is rejected before it reaches the store.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.is_deleted.is_none()
    }
}

/// Authoritative sequencing returned to the writer after a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpsertReceipt {
    /// Conversation-order sequence of the row (unchanged on edits).
    pub chat_sequence_id: i64,
    /// Edit version after this write.
    pub message_sequence_id: i64,
    /// Instant of the row's first write.
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_receipt() -> UpsertReceipt {
        UpsertReceipt {
            chat_sequence_id: 4,
            message_sequence_id: 1,
            created_at: Timestamp(Utc.with_ymd_and_hms(2025, 3, 8, 14, 30, 0).unwrap()),
        }
    }

    #[test]
    fn message_serializes_with_camel_case_keys() {
        let upsert = MessageUpsert {
            message_id: "m1".into(),
            client_id: None,
            text: Some("hi".into()),
            is_deleted: None,
        };
        let message = Message::authoritative("c1", &upsert, &sample_receipt());
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["chatSequenceId"], 4);
        assert_eq!(json["messageSequenceId"], 1);
        assert_eq!(json["text"], "hi");
        assert!(json.get("isDeleted").is_none());
        assert!(json.get("isOptimistic").is_none());
    }

    #[test]
    fn authoritative_row_carries_tombstone_flag() {
        let upsert = MessageUpsert {
            message_id: "m1".into(),
            client_id: Some("a".into()),
            text: None,
            is_deleted: Some(true),
        };
        let message = Message::authoritative("c1", &upsert, &sample_receipt());

        assert!(message.tombstoned());
        assert!(!message.optimistic());
        assert_eq!(message.text, None);
    }

    #[test]
    fn empty_upsert_is_detected() {
        let upsert = MessageUpsert {
            message_id: "m1".into(),
            client_id: None,
            text: None,
            is_deleted: None,
        };

        assert!(upsert.is_empty());
    }

    #[test]
    fn upsert_round_trips_through_json() {
        let parsed: MessageUpsert =
            serde_json::from_str(r#"{"messageId":"m2","clientId":"a","text":"yo"}"#).unwrap();

        assert_eq!(parsed.message_id, "m2");
        assert_eq!(parsed.client_id.as_deref(), Some("a"));
        assert_eq!(parsed.text.as_deref(), Some("yo"));
        assert_eq!(parsed.is_deleted, None);
    }
}
