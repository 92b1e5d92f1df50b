//! Property-based tests for the canonical event encoding.
//!
//! Verifies:
//! - decode(encode(event)) == event for arbitrary events
//! - encoding is deterministic
//! - truncation at any point is an error, never a panic
//! - the integrity tag never feeds the canonical bytes

use proptest::prelude::*;

use lighthouse_core::encoding::{
    TAG_LEN, decode_canonical, decode_record, encode_canonical, encode_record,
};
use lighthouse_core::event::{Event, EventPayload, EventType};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

fn arb_path() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_/.]{0,30}"
}

fn arb_payload() -> impl Strategy<Value = EventPayload> {
    prop_oneof![
        (arb_path(), arb_name(), any::<u64>()).prop_map(|(path, hash, size_bytes)| {
            EventPayload::FileWritten {
                path,
                content_hash: hash,
                size_bytes,
            }
        }),
        (arb_path(), any::<u32>(), arb_name(), arb_name(), arb_name()).prop_map(
            |(path, line, category, message, author)| EventPayload::AnnotationAdded {
                path,
                line,
                category,
                message,
                author,
            }
        ),
        (arb_name(), any::<u64>()).prop_map(|(name, at_sequence)| {
            EventPayload::SnapshotCreated { name, at_sequence }
        }),
        (arb_name(), arb_name(), arb_name()).prop_map(|(pair_id, builder_id, task)| {
            EventPayload::PairRequested {
                pair_id,
                builder_id,
                task,
            }
        }),
        (arb_name(), arb_name()).prop_map(|(agent_id, reason)| {
            EventPayload::IdentityRevoked { agent_id, reason }
        }),
        (any::<u64>(), arb_name()).prop_map(|(truncated_from_sequence, verified_tag)| {
            EventPayload::LogRecovered {
                truncated_from_sequence,
                verified_tag,
            }
        }),
    ]
}

prop_compose! {
    fn arb_event()(
        payload in arb_payload(),
        sequence in 1u64..u64::MAX / 2,
        event_id in arb_name(),
        agent_id in arb_name(),
        timestamp_ms in 0i64..=4_102_444_800_000,
        causation in proptest::option::of(arb_name()),
        tag_byte in any::<u8>(),
    ) -> Event {
        let event_type = payload.event_type();
        let key = match &payload {
            EventPayload::FileWritten { path, .. }
            | EventPayload::AnnotationAdded { path, .. } => path.clone(),
            EventPayload::PairRequested { pair_id, .. } => pair_id.clone(),
            _ => "k".to_string(),
        };
        Event {
            sequence,
            event_id,
            event_type,
            aggregate_id: format!("{}{key}", event_type.aggregate_prefix()),
            agent_id,
            timestamp_ms,
            causation_id: causation,
            payload,
            integrity_tag: hex::encode([tag_byte; TAG_LEN]),
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// Round trip
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(400))]

    /// Full records round-trip exactly.
    #[test]
    fn prop_record_roundtrip(event in arb_event()) {
        let record = encode_record(&event).unwrap();
        let back = decode_record(&record).unwrap();
        prop_assert_eq!(back, event);
    }

    /// Encoding the same event twice yields identical bytes.
    #[test]
    fn prop_encoding_deterministic(event in arb_event()) {
        prop_assert_eq!(encode_canonical(&event), encode_canonical(&event));
    }

    /// The tag never influences the canonical bytes.
    #[test]
    fn prop_tag_independent(event in arb_event(), other_tag in any::<u8>()) {
        let a = encode_canonical(&event);
        let mut changed = event;
        changed.integrity_tag = hex::encode([other_tag; TAG_LEN]);
        prop_assert_eq!(a, encode_canonical(&changed));
    }

    /// Truncating a record anywhere fails cleanly.
    #[test]
    fn prop_truncation_is_an_error(event in arb_event(), cut_ratio in 0.0f64..1.0) {
        let record = encode_record(&event).unwrap();
        let cut = ((record.len() as f64) * cut_ratio) as usize;
        if cut < record.len() {
            prop_assert!(decode_record(&record[..cut]).is_err());
        }
    }

    /// Distinct events encode to distinct canonical bytes.
    #[test]
    fn prop_sequence_feeds_encoding(event in arb_event()) {
        let a = encode_canonical(&event);
        let mut bumped = event;
        bumped.sequence += 1;
        prop_assert_ne!(a, encode_canonical(&bumped));
    }

    /// Canonical decode rejects trailing garbage.
    #[test]
    fn prop_trailing_bytes_rejected(event in arb_event(), junk in 1u8..=255) {
        let mut canonical = encode_canonical(&event);
        canonical.push(junk);
        prop_assert!(decode_canonical(&canonical).is_err());
    }
}

#[test]
fn every_event_type_is_exercised_by_the_model() {
    // The strategy above covers a sample; the unit suite in `encoding`
    // covers every variant. This guards the count so a new event type
    // fails loudly here when it is not added to both.
    assert_eq!(EventType::all().len(), 17);
}
