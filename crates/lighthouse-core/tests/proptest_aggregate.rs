//! Property-based tests for the project aggregate fold.
//!
//! Verifies:
//! - folding is idempotent per event (duplicate delivery is harmless)
//! - the fold is a pure function of the event sequence
//! - latest-write-wins per path, tracked by sequence

use proptest::prelude::*;

use lighthouse_core::aggregate::ProjectAggregate;
use lighthouse_core::event::{Event, EventPayload};

fn event(sequence: u64, payload: EventPayload) -> Event {
    let event_type = payload.event_type();
    let key = match &payload {
        EventPayload::FileWritten { path, .. } | EventPayload::AnnotationAdded { path, .. } => {
            path.clone()
        }
        EventPayload::PairSuggestion { pair_id, .. } => pair_id.clone(),
        EventPayload::SnapshotCreated { name, .. } => name.clone(),
        _ => "k".to_string(),
    };
    Event {
        sequence,
        event_id: format!("ev_{sequence}"),
        event_type,
        aggregate_id: format!("{}{key}", event_type.aggregate_prefix()),
        agent_id: "alice".to_string(),
        timestamp_ms: 0,
        causation_id: None,
        payload,
        integrity_tag: String::new(),
    }
}

fn arb_payload() -> impl Strategy<Value = EventPayload> {
    prop_oneof![
        ("[a-c]", "[a-z]{4}").prop_map(|(path, hash)| EventPayload::FileWritten {
            path,
            content_hash: hash,
            size_bytes: 1,
        }),
        ("[a-c]", 1u32..100, "[a-z]{4}").prop_map(|(path, line, message)| {
            EventPayload::AnnotationAdded {
                path,
                line,
                category: "style".to_string(),
                message,
                author: "eve".to_string(),
            }
        }),
        ("[a-c]", 1u32..100, "[a-z]{4}").prop_map(|(pair_id, line, text)| {
            EventPayload::PairSuggestion {
                pair_id,
                line,
                text,
                author: "eve".to_string(),
            }
        }),
    ]
}

fn arb_events() -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec(arb_payload(), 1..40).prop_map(|payloads| {
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| event(i as u64 + 1, payload))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Replaying each event twice equals replaying it once.
    #[test]
    fn prop_fold_is_idempotent(events in arb_events()) {
        let mut once = ProjectAggregate::default();
        let mut twice = ProjectAggregate::default();
        for e in &events {
            once.apply(e);
            twice.apply(e);
            twice.apply(e);
        }
        prop_assert_eq!(once, twice);
    }

    /// Replaying a random prefix again after the fact changes nothing.
    #[test]
    fn prop_replay_of_prefix_is_noop(events in arb_events(), cut in any::<prop::sample::Index>()) {
        let mut folded = ProjectAggregate::default();
        for e in &events {
            folded.apply(e);
        }
        let snapshot = folded.clone();

        let cut = cut.index(events.len());
        for e in &events[..cut] {
            folded.apply(e);
        }
        prop_assert_eq!(folded, snapshot);
    }

    /// Two independent folds of the same events agree.
    #[test]
    fn prop_fold_is_deterministic(events in arb_events()) {
        let mut a = ProjectAggregate::default();
        let mut b = ProjectAggregate::default();
        for e in &events {
            a.apply(e);
        }
        for e in &events {
            b.apply(e);
        }
        prop_assert_eq!(a, b);
    }

    /// The latest write to a path wins, and its sequence is recorded.
    #[test]
    fn prop_latest_write_wins(events in arb_events()) {
        let mut folded = ProjectAggregate::default();
        for e in &events {
            folded.apply(e);
        }
        for (path, state) in &folded.files {
            let last_write = events
                .iter()
                .rev()
                .find_map(|e| match &e.payload {
                    EventPayload::FileWritten { path: p, content_hash, .. } if p == path => {
                        Some((e.sequence, content_hash.clone()))
                    }
                    _ => None,
                })
                .expect("file state implies a write");
            prop_assert_eq!(state.latest_sequence, last_write.0);
            prop_assert_eq!(&state.content_hash, &last_write.1);
        }
    }

    /// Annotation lists grow in sequence order.
    #[test]
    fn prop_annotations_are_ordered(events in arb_events()) {
        let mut folded = ProjectAggregate::default();
        for e in &events {
            folded.apply(e);
        }
        for notes in folded.annotations.values() {
            for pair in notes.windows(2) {
                prop_assert!(pair[0].sequence < pair[1].sequence);
            }
        }
    }
}
