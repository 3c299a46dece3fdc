//! Property tests for transcript ordering and duplicate suppression.

use proptest::prelude::*;
use roomsync::protocol::{ChatEntry, Origin};
use roomsync::transcript::{Appended, TranscriptStore};

fn entry(id: u8, body: &str) -> ChatEntry {
    ChatEntry {
        id: format!("id-{id}"),
        author: "ada".to_string(),
        body: body.to_string(),
        created_at: String::new(),
        origin: Origin::User,
    }
}

proptest! {
    #[test]
    fn view_order_equals_first_append_order(ids in proptest::collection::vec(0u8..32, 0..64)) {
        let mut store = TranscriptStore::new();
        let mut expected: Vec<String> = Vec::new();
        for (n, id) in ids.iter().enumerate() {
            let e = entry(*id, &format!("body {n}"));
            let key = e.id.clone();
            let first_time = !expected.contains(&key);
            let outcome = store.append(e);
            prop_assert_eq!(outcome == Appended::Added, first_time);
            if first_time {
                expected.push(key);
            }
        }
        let got: Vec<String> = store.entries().iter().map(|e| e.id.clone()).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn reappending_any_entry_leaves_log_unchanged(count in 1usize..20, pick in 0usize..20) {
        let mut store = TranscriptStore::new();
        for i in 0..count {
            store.append(entry(i as u8, "x"));
        }
        let before = store.entries().to_vec();
        let again = before[pick % count].clone();
        prop_assert_eq!(store.append(again), Appended::Duplicate);
        prop_assert_eq!(store.entries(), before.as_slice());
    }
}
