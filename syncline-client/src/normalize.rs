//! The reconciliation policy shared by every chat view.
//!
//! `normalize` collapses a bag of message rows (snapshot rows, live updates,
//! write receipts, pending local edits) into the view a user should see: one
//! row per message id, tombstones hidden, bounded to the most recent gap-free
//! run of conversation sequence numbers.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use shared::models::Message;

/// Default bound on the reconciled view length.
pub const DEFAULT_WINDOW: usize = 10;

/// Whether `candidate` supersedes `incumbent` for the same message id.
///
/// Within a kind the higher edit version wins. Across kinds, a pending local
/// edit shadows authoritative rows until one with an equal-or-higher edit
/// version arrives; on the equal-version tie the authoritative row wins, which
/// is what clears the optimistic flag after the server echoes a write back.
fn beats(candidate: &Message, incumbent: &Message) -> bool {
    match (candidate.optimistic(), incumbent.optimistic()) {
        (false, true) => candidate.message_sequence_id >= incumbent.message_sequence_id,
        _ => candidate.message_sequence_id > incumbent.message_sequence_id,
    }
}

/// Reduces `rows` to the reconciled, ascending view bounded by `window`.
///
/// Steps: keep the winning row per message id, drop tombstones, order by
/// `chat_sequence_id` descending, keep at most `window` rows, then keep only
/// the contiguous suffix ending at the highest sequence held (a gap means
/// unfetched history, and everything older than the gap is unreliable).
/// The result is ascending. Idempotent: feeding the output back in returns
/// the same view.
#[must_use]
pub fn normalize(rows: &[Message], window: usize) -> Vec<Message> {
    let mut winners: HashMap<&str, &Message> = HashMap::new();
    for row in rows {
        match winners.entry(row.message_id.as_str()) {
            Entry::Occupied(mut slot) => {
                if beats(row, slot.get()) {
                    slot.insert(row);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
        }
    }

    let mut view: Vec<&Message> = winners
        .into_values()
        .filter(|row| !row.tombstoned())
        .collect();
    view.sort_by(|a, b| {
        b.chat_sequence_id
            .cmp(&a.chat_sequence_id)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
    view.truncate(window);

    // Walk down from the newest row; the first break in sequence continuity
    // truncates everything older.
    let mut contiguous = 0;
    for (index, row) in view.iter().enumerate() {
        if index > 0 && view[index - 1].chat_sequence_id - row.chat_sequence_id != 1 {
            break;
        }
        contiguous = index + 1;
    }
    view.truncate(contiguous);

    view.into_iter().rev().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::Timestamp;
    use test_case::test_case;

    fn row(message_id: &str, chat_seq: i64, msg_seq: i64, text: &str) -> Message {
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

    fn optimistic(message_id: &str, chat_seq: i64, msg_seq: i64, text: &str) -> Message {
        Message {
            is_optimistic: Some(true),
            ..row(message_id, chat_seq, msg_seq, text)
        }
    }

    fn tombstone(message_id: &str, chat_seq: i64, msg_seq: i64) -> Message {
        Message {
            text: None,
            is_deleted: Some(true),
            ..row(message_id, chat_seq, msg_seq, "")
        }
    }

    fn sequences(view: &[Message]) -> Vec<i64> {
        view.iter().map(|m| m.chat_sequence_id).collect()
    }

    #[test_case(&[0, 1, 2, 4, 5], &[4, 5]; "gap keeps only the suffix")]
    #[test_case(&[0, 1, 2, 3], &[0, 1, 2, 3]; "dense run survives whole")]
    #[test_case(&[2, 5, 6, 9], &[9]; "repeated gaps reduce to the newest row")]
    #[test_case(&[7], &[7]; "single row")]
    #[test_case(&[], &[]; "empty input")]
    fn window_keeps_the_contiguous_suffix(present: &[i64], expected: &[i64]) {
        let rows: Vec<Message> = present
            .iter()
            .map(|seq| row(&format!("m{seq}"), *seq, 0, "x"))
            .collect();

        assert_eq!(sequences(&normalize(&rows, DEFAULT_WINDOW)), expected);
    }

    #[test]
    fn highest_edit_version_wins_per_message() {
        let rows = vec![
            row("m1", 0, 0, "first"),
            row("m1", 0, 2, "third"),
            row("m1", 0, 1, "second"),
        ];

        let view = normalize(&rows, DEFAULT_WINDOW);

        assert_eq!(view.len(), 1);
        assert_eq!(view[0].text.as_deref(), Some("third"));
    }

    #[test]
    fn optimistic_edit_shadows_a_stale_echo() {
        // The local edit is at version 2; an echo of the previous write (version
        // 1) must not cover it.
        let rows = vec![optimistic("m1", 0, 2, "local"), row("m1", 0, 1, "stale")];

        let view = normalize(&rows, DEFAULT_WINDOW);

        assert_eq!(view[0].text.as_deref(), Some("local"));
        assert!(view[0].optimistic());
    }

    #[test]
    fn matching_authoritative_row_clears_the_flag() {
        let rows = vec![optimistic("m1", 0, 2, "local"), row("m1", 0, 2, "acked")];

        let view = normalize(&rows, DEFAULT_WINDOW);

        assert_eq!(view[0].text.as_deref(), Some("acked"));
        assert!(!view[0].optimistic());
    }

    #[test]
    fn later_local_edit_replaces_an_earlier_one() {
        let rows = vec![
            optimistic("m1", 0, 1, "draft one"),
            optimistic("m1", 0, 2, "draft two"),
        ];

        let view = normalize(&rows, DEFAULT_WINDOW);

        assert_eq!(view[0].text.as_deref(), Some("draft two"));
    }

    #[test]
    fn tombstones_are_hidden_and_break_continuity() {
        let rows = vec![
            row("m0", 0, 0, "a"),
            row("m1", 1, 0, "b"),
            tombstone("m2", 2, 1),
            row("m3", 3, 0, "c"),
        ];

        let view = normalize(&rows, DEFAULT_WINDOW);

        // The deletion at sequence 2 opens a gap, so only the newer side of it
        // remains visible.
        assert_eq!(sequences(&view), vec![3]);
    }

    #[test]
    fn window_bound_applies_before_continuity() {
        let rows: Vec<Message> = (0..15)
            .map(|seq| row(&format!("m{seq}"), seq, 0, "x"))
            .collect();

        let view = normalize(&rows, DEFAULT_WINDOW);

        assert_eq!(view.len(), DEFAULT_WINDOW);
        assert_eq!(sequences(&view), (5..15).collect::<Vec<_>>());
    }

    #[test]
    fn normalize_is_idempotent() {
        let rows = vec![
            row("m0", 0, 0, "a"),
            row("m1", 1, 3, "b"),
            optimistic("m1", 1, 4, "b local"),
            tombstone("m2", 2, 1),
            row("m3", 4, 0, "c"),
            row("m4", 5, 0, "d"),
        ];

        let once = normalize(&rows, DEFAULT_WINDOW);
        let twice = normalize(&once, DEFAULT_WINDOW);

        assert_eq!(once, twice);
    }
}
