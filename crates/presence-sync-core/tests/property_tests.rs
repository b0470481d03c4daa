//! Property-based tests for the delta engine and sequencing
//!
//! Uses proptest to check invariants that must hold for any action stream
//! or arrival order.

use std::time::Duration;

use proptest::prelude::*;
use presence_sync_core::sync::{ReliabilityLayer, RetryDecision, SeqVerdict, Sequencer};
use presence_sync_core::{
    JsonMap, LocalAction, Role, ScrollPosition, SessionId, SharedState, StateDelta, ViewName,
};
use serde_json::Value;

// ============================================================================
// Strategy Generators
// ============================================================================

fn package_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-D][1-3]").expect("valid regex")
}

fn view_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(ViewName::ALL.to_vec()).prop_map(|v| v.as_str().to_string())
}

/// Actions the Authority may take
fn authority_action_strategy() -> impl Strategy<Value = LocalAction> {
    prop_oneof![
        view_strategy().prop_map(|view| LocalAction::Navigate {
            view,
            params: JsonMap::new(),
        }),
        prop::collection::vec(package_id_strategy(), 0..5).prop_map(LocalAction::SharePackages),
        package_id_strategy().prop_map(LocalAction::ToggleCompare),
        prop::collection::vec(package_id_strategy(), 0..6).prop_map(LocalAction::SetCompare),
        package_id_strategy().prop_map(LocalAction::Select),
        package_id_strategy().prop_map(LocalAction::Unselect),
        "[a-z]{1,8}".prop_map(LocalAction::PaymentStep),
    ]
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// A replica applying the authority's deltas off the wire, in order,
    /// holds the same state after every step
    #[test]
    fn replica_matches_authority(actions in prop::collection::vec(authority_action_strategy(), 1..30)) {
        let session = SessionId::from("prop");
        let mut authority = SharedState::new(session.clone());
        let mut replica = SharedState::new(session);

        for action in actions {
            let delta = action.to_delta(&authority, Role::Authority).unwrap();
            delta.apply_to(&mut authority);

            let wire = serde_json::to_string(&delta).unwrap();
            let received: StateDelta = serde_json::from_str(&wire).unwrap();
            received.apply_to(&mut replica);

            prop_assert_eq!(&replica, &authority);
        }
    }

    /// The compare set never holds the same id twice
    #[test]
    fn compare_set_stays_unique(actions in prop::collection::vec(authority_action_strategy(), 1..40)) {
        let mut state = SharedState::default();
        for action in actions {
            action.to_delta(&state, Role::Authority).unwrap().apply_to(&mut state);
            let set = &state.selection.compare_set;
            let mut sorted = set.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), set.len());
        }
    }

    /// Metadata keys accumulate; no delta erases a key it does not name
    #[test]
    fn metadata_keys_accumulate(keys in prop::collection::vec("[a-z]{1,6}", 1..15)) {
        let mut state = SharedState::default();
        for (i, key) in keys.iter().enumerate() {
            StateDelta::metadata_entry(key.clone(), Value::from(i as u64)).apply_to(&mut state);
        }
        for key in &keys {
            prop_assert!(state.metadata.contains_key(key));
        }
    }

    /// Whatever the arrival order, only the next sequence is ever applied
    #[test]
    fn sequencer_applies_in_order(arrivals in prop::collection::vec(1u64..20, 0..60)) {
        let mut sequencer = Sequencer::new();
        let mut applied = Vec::new();

        for seq in arrivals {
            match sequencer.classify(seq) {
                SeqVerdict::Next => {
                    sequencer.advance(seq);
                    applied.push(seq);
                }
                SeqVerdict::Duplicate => prop_assert!(seq <= sequencer.last_applied()),
                SeqVerdict::Gap { expected } => {
                    prop_assert_eq!(expected, sequencer.last_applied() + 1);
                    prop_assert!(seq > expected);
                }
            }
        }

        let expected: Vec<u64> = (1..=applied.len() as u64).collect();
        prop_assert_eq!(applied, expected);
    }

    /// An unacknowledged entry is retransmitted exactly `max_retries` times
    #[test]
    fn retry_budget_is_exact(max_retries in 0u32..8, base_ms in 1u64..2_000) {
        let mut layer = ReliabilityLayer::new(Duration::from_millis(base_ms), max_retries);
        let generation = layer.track(1, "frame".into());

        let mut retransmits = 0;
        loop {
            match layer.on_timeout(1, generation) {
                RetryDecision::Retransmit { attempt, next_delay, .. } => {
                    retransmits += 1;
                    prop_assert_eq!(attempt, retransmits);
                    prop_assert_eq!(next_delay, layer.delay_for(attempt + 1));
                }
                RetryDecision::Exhausted { attempts } => {
                    prop_assert_eq!(attempts, max_retries + 1);
                    break;
                }
                RetryDecision::Stale => prop_assert!(false, "entry went stale"),
            }
        }
        prop_assert_eq!(retransmits, max_retries);
        prop_assert!(layer.is_empty());
    }

    /// Scroll offsets inside the scrollable range map into [0, 1]
    #[test]
    fn scroll_fraction_in_range(content in 1.0f64..10_000.0, viewport_ratio in 0.0f64..1.0, pos in 0.0f64..1.0) {
        let viewport = content * viewport_ratio;
        let offset = (content - viewport) * pos;
        let fraction = ScrollPosition::fraction(offset, content, viewport);
        prop_assert!((0.0..=1.0 + 1e-9).contains(&fraction));
    }
}
