//! Two-layer chat store: authoritative rows underneath, pending optimistic
//! edits on top, merged by [`normalize`] on every read.

use std::collections::HashMap;

use shared::models::{Message, MessageUpsert, Timestamp};
use tracing::debug;

use crate::normalize::{DEFAULT_WINDOW, normalize};

/// Client-side replica of one conversation.
///
/// The authoritative layer holds the latest server-produced row per message
/// id, tombstones included. The overlay holds at most one pending local edit
/// per message id; an entry clears as soon as an authoritative row with an
/// equal-or-higher edit version for that id is observed, which is how a write
/// receipt or the broadcast echo promotes an optimistic row. Snapshot rows
/// and live updates go through the same [`ChatReplica::apply_authoritative`]
/// path, so they can arrive in either order and still converge.
#[derive(Debug, Clone)]
pub struct ChatReplica {
    chat_id: String,
    window: usize,
    authoritative: HashMap<String, Message>,
    overlay: HashMap<String, Message>,
}

impl ChatReplica {
    /// A replica for `chat_id` with the default view window.
    #[must_use]
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self::with_window(chat_id, DEFAULT_WINDOW)
    }

    /// A replica with an explicit view window.
    #[must_use]
    pub fn with_window(chat_id: impl Into<String>, window: usize) -> Self {
        Self {
            chat_id: chat_id.into(),
            window,
            authoritative: HashMap::new(),
            overlay: HashMap::new(),
        }
    }

    /// The conversation this replica mirrors.
    #[must_use]
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// The view length bound.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Merges a snapshot load into the replica. Rows already superseded by
    /// live updates stay; a snapshot never rolls the replica backwards.
    pub fn apply_snapshot(&mut self, rows: Vec<Message>) {
        for row in rows {
            self.apply_authoritative(row);
        }
    }

    /// Folds one authoritative row (snapshot row, live update, or write
    /// receipt) into the replica. Stale rows are ignored; a row that catches
    /// up with a pending local edit clears it from the overlay.
    pub fn apply_authoritative(&mut self, mut row: Message) {
        if let Some(existing) = self.authoritative.get(&row.message_id)
            && existing.message_sequence_id > row.message_sequence_id
        {
            debug!(
                message_id = %row.message_id,
                held = existing.message_sequence_id,
                received = row.message_sequence_id,
                "ignoring stale row"
            );
            return;
        }

        // The flag is client-local; a row from the server never carries it.
        row.is_optimistic = None;

        let caught_up = self
            .overlay
            .get(&row.message_id)
            .is_some_and(|pending| row.message_sequence_id >= pending.message_sequence_id);
        if caught_up {
            self.overlay.remove(&row.message_id);
        }

        self.authoritative.insert(row.message_id.clone(), row);
    }

    /// Splices a synthetic row for a local edit into the overlay and returns
    /// it, so the caller can send the matching write to the server.
    ///
    /// An edit to a known message keeps its conversation position and bumps
    /// the edit version; a brand-new message guesses the next conversation
    /// sequence, to be corrected by the authoritative receipt (matched by
    /// message id) if another writer got there first.
    pub fn upsert_local(&mut self, upsert: &MessageUpsert) -> Message {
        let current = self
            .overlay
            .get(&upsert.message_id)
            .or_else(|| self.authoritative.get(&upsert.message_id));

        let row = match current {
            Some(existing) => Message {
                message_id: upsert.message_id.clone(),
                chat_id: self.chat_id.clone(),
                chat_sequence_id: existing.chat_sequence_id,
                message_sequence_id: existing.message_sequence_id + 1,
                created_at: existing.created_at,
                text: upsert.text.clone(),
                is_deleted: upsert.is_deleted,
                is_optimistic: Some(true),
            },
            None => Message {
                message_id: upsert.message_id.clone(),
                chat_id: self.chat_id.clone(),
                chat_sequence_id: self.next_sequence_guess(),
                message_sequence_id: 0,
                created_at: Timestamp::now(),
                text: upsert.text.clone(),
                is_deleted: upsert.is_deleted,
                is_optimistic: Some(true),
            },
        };

        self.overlay.insert(row.message_id.clone(), row.clone());
        row
    }

    /// The reconciled view: both layers merged through [`normalize`].
    #[must_use]
    pub fn view(&self) -> Vec<Message> {
        let rows: Vec<Message> = self
            .authoritative
            .values()
            .chain(self.overlay.values())
            .cloned()
            .collect();
        normalize(&rows, self.window)
    }

    /// Whether any local edits are still waiting for their authoritative echo.
    #[must_use]
    pub fn has_pending_edits(&self) -> bool {
        !self.overlay.is_empty()
    }

    fn next_sequence_guess(&self) -> i64 {
        self.authoritative
            .values()
            .chain(self.overlay.values())
            .map(|row| row.chat_sequence_id)
            .max()
            .map_or(0, |max| max + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authoritative(message_id: &str, chat_seq: i64, msg_seq: i64, text: &str) -> Message {
        Message {
            message_id: message_id.to_string(),
            chat_id: "c1".to_string(),
            chat_sequence_id: chat_seq,
            message_sequence_id: msg_seq,
            created_at: Timestamp::now(),
            text: Some(text.to_string()),
            is_deleted: None,
            is_optimistic: None,
        }
    }

    fn edit(message_id: &str, text: &str) -> MessageUpsert {
        MessageUpsert {
            message_id: message_id.to_string(),
            client_id: Some("me".to_string()),
            text: Some(text.to_string()),
            is_deleted: None,
        }
    }

    #[test]
    fn local_edit_is_visible_immediately() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 0, "hello"));

        replica.upsert_local(&edit("m1", "hello!"));

        let view = replica.view();
        assert_eq!(view[0].text.as_deref(), Some("hello!"));
        assert!(view[0].optimistic());
        assert!(replica.has_pending_edits());
    }

    #[test]
    fn authoritative_echo_promotes_the_edit() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 0, "hello"));
        replica.upsert_local(&edit("m1", "hello!"));

        replica.apply_authoritative(authoritative("m1", 0, 1, "hello!"));

        let view = replica.view();
        assert_eq!(view[0].text.as_deref(), Some("hello!"));
        assert!(!view[0].optimistic());
        assert!(!replica.has_pending_edits());
    }

    #[test]
    fn stale_echo_does_not_shadow_the_pending_edit() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 0, "hello"));
        replica.upsert_local(&edit("m1", "hello!"));

        // Another client's older write arrives after our local edit.
        replica.apply_authoritative(authoritative("m1", 0, 0, "hi"));

        let view = replica.view();
        assert_eq!(view[0].text.as_deref(), Some("hello!"));
        assert!(view[0].optimistic());
        assert!(replica.has_pending_edits());
    }

    #[test]
    fn new_message_guesses_the_next_sequence() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 0, "a"));
        replica.apply_authoritative(authoritative("m2", 1, 0, "b"));

        let synthetic = replica.upsert_local(&edit("m3", "c"));

        assert_eq!(synthetic.chat_sequence_id, 2);
        assert_eq!(synthetic.message_sequence_id, 0);
        assert_eq!(replica.view().len(), 3);
    }

    #[test]
    fn authoritative_sequence_replaces_the_guess() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 0, "a"));
        let synthetic = replica.upsert_local(&edit("m2", "b"));
        assert_eq!(synthetic.chat_sequence_id, 1);

        // Another writer claimed sequence 1 first; ours landed at 2.
        replica.apply_authoritative(authoritative("m9", 1, 0, "theirs"));
        replica.apply_authoritative(authoritative("m2", 2, 0, "b"));

        let view = replica.view();
        let ours: Vec<_> = view.iter().filter(|m| m.message_id == "m2").collect();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].chat_sequence_id, 2);
        assert!(!ours[0].optimistic());
        assert!(!replica.has_pending_edits());
    }

    #[test]
    fn snapshot_never_rolls_back_live_updates() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 2, "newest"));

        replica.apply_snapshot(vec![
            authoritative("m1", 0, 1, "older"),
            authoritative("m2", 1, 0, "b"),
        ]);

        let view = replica.view();
        assert_eq!(view[0].text.as_deref(), Some("newest"));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn local_delete_hides_the_row() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 0, "a"));
        replica.apply_authoritative(authoritative("m2", 1, 0, "b"));

        replica.upsert_local(&MessageUpsert {
            message_id: "m2".to_string(),
            client_id: Some("me".to_string()),
            text: None,
            is_deleted: Some(true),
        });

        let view = replica.view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].message_id, "m1");
    }

    #[test]
    fn consecutive_local_edits_stack() {
        let mut replica = ChatReplica::new("c1");
        replica.apply_authoritative(authoritative("m1", 0, 0, "v0"));

        let first = replica.upsert_local(&edit("m1", "v1"));
        let second = replica.upsert_local(&edit("m1", "v2"));

        assert_eq!(first.message_sequence_id, 1);
        assert_eq!(second.message_sequence_id, 2);
        // The echo of the first edit must not clear the second.
        replica.apply_authoritative(authoritative("m1", 0, 1, "v1"));
        assert!(replica.has_pending_edits());
        assert_eq!(replica.view()[0].text.as_deref(), Some("v2"));
    }

    #[test]
    fn view_respects_the_window() {
        let mut replica = ChatReplica::with_window("c1", 3);
        for seq in 0..6 {
            replica.apply_authoritative(authoritative(&format!("m{seq}"), seq, 0, "x"));
        }

        let view = replica.view();
        assert_eq!(view.len(), 3);
        assert_eq!(view.last().map(|m| m.chat_sequence_id), Some(5));
    }
}
