//! Client-side mirror of one channel's presence set.

use std::collections::BTreeMap;

use serde_json::Value;
use shared::models::{PresenceEntry, PresenceUpdate};
use tracing::debug;

/// Who is on a channel right now, as far as this client knows.
///
/// Fed by the snapshot endpoint and by diff broadcasts; both arrive as
/// [`PresenceUpdate`] values, so a snapshot is just a clear followed by a
/// batch of upserts. Entries are kept sorted by client id.
#[derive(Debug, Clone)]
pub struct PresenceReplica {
    channel_id: String,
    entries: BTreeMap<String, Value>,
}

impl PresenceReplica {
    /// An empty mirror for `channel_id`.
    #[must_use]
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            entries: BTreeMap::new(),
        }
    }

    /// The channel this mirror tracks.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Replaces the mirror with a snapshot.
    pub fn apply_snapshot(&mut self, updates: Vec<PresenceUpdate>) {
        self.entries.clear();
        for update in updates {
            self.apply(update);
        }
    }

    /// Applies one diff. Diffs for other channels are dropped; a relay never
    /// mixes channels, so seeing one here means a subscription is misrouted.
    pub fn apply(&mut self, update: PresenceUpdate) {
        if update.channel_id() != self.channel_id {
            debug!(
                channel = update.channel_id(),
                expected = %self.channel_id,
                "dropping diff for another channel"
            );
            return;
        }
        match update {
            PresenceUpdate::Upsert {
                client_id, data, ..
            } => {
                self.entries.insert(client_id, data);
            }
            PresenceUpdate::Delete { client_id, .. } => {
                self.entries.remove(&client_id);
            }
        }
    }

    /// Whether `client_id` currently has an entry.
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.entries.contains_key(client_id)
    }

    /// All live entries, ordered by client id.
    #[must_use]
    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.entries
            .iter()
            .map(|(client_id, data)| PresenceEntry {
                client_id: client_id.clone(),
                data: data.clone(),
            })
            .collect()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the channel looks empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(client_id: &str, cursor: i32) -> PresenceUpdate {
        PresenceUpdate::Upsert {
            channel_id: "room-1".to_string(),
            client_id: client_id.to_string(),
            data: json!({ "cursor": cursor }),
        }
    }

    fn delete(client_id: &str) -> PresenceUpdate {
        PresenceUpdate::Delete {
            channel_id: "room-1".to_string(),
            client_id: client_id.to_string(),
        }
    }

    #[test]
    fn upserts_and_deletes_mutate_the_mirror() {
        let mut replica = PresenceReplica::new("room-1");

        replica.apply(upsert("b", 1));
        replica.apply(upsert("a", 2));
        assert_eq!(replica.len(), 2);

        replica.apply(delete("b"));
        assert!(!replica.contains("b"));
        assert!(replica.contains("a"));
    }

    #[test]
    fn repeated_upsert_replaces_the_data() {
        let mut replica = PresenceReplica::new("room-1");

        replica.apply(upsert("a", 1));
        replica.apply(upsert("a", 9));

        let entries = replica.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data["cursor"], 9);
    }

    #[test]
    fn snapshot_replaces_prior_state() {
        let mut replica = PresenceReplica::new("room-1");
        replica.apply(upsert("stale", 0));

        replica.apply_snapshot(vec![upsert("a", 1), upsert("b", 2)]);

        assert!(!replica.contains("stale"));
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn diffs_for_other_channels_are_dropped() {
        let mut replica = PresenceReplica::new("room-1");

        replica.apply(PresenceUpdate::Upsert {
            channel_id: "room-2".to_string(),
            client_id: "a".to_string(),
            data: json!({}),
        });

        assert!(replica.is_empty());
    }

    #[test]
    fn entries_are_ordered_by_client_id() {
        let mut replica = PresenceReplica::new("room-1");
        replica.apply(upsert("zed", 1));
        replica.apply(upsert("amy", 2));

        let ids: Vec<_> = replica
            .entries()
            .into_iter()
            .map(|entry| entry.client_id)
            .collect();

        assert_eq!(ids, vec!["amy", "zed"]);
    }
}
