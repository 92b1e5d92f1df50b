//! Property-based tests for the expert consensus rule.
//!
//! Verifies the fixed aggregation:
//! - a confident deny always decides deny
//! - approve requires a ⌈N/2⌉ majority of confident approvals
//! - panels with no signal fail closed
//! - the verdict is a pure function of the responses

use proptest::prelude::*;

use lighthouse_core::event::{DelegationVerdict, ExpertResponseRecord, ExpertVerdict};
use lighthouse_core::expert::consensus;

const TAU_APPROVE: f64 = 0.6;
const TAU_DENY: f64 = 0.7;

fn arb_verdict() -> impl Strategy<Value = ExpertVerdict> {
    prop_oneof![
        Just(ExpertVerdict::Approve),
        Just(ExpertVerdict::Deny),
        Just(ExpertVerdict::Abstain),
        Just(ExpertVerdict::NeedsRevision),
    ]
}

prop_compose! {
    fn arb_response()(verdict in arb_verdict(), confidence in 0.0f64..=1.0) -> ExpertResponseRecord {
        ExpertResponseRecord {
            expert_id: "e".to_string(),
            verdict,
            confidence,
        }
    }
}

fn arb_panel(n: usize) -> impl Strategy<Value = Vec<ExpertResponseRecord>> {
    prop::collection::vec(arb_response(), n)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Any deny at or above τ_deny decides the verdict.
    #[test]
    fn prop_confident_deny_wins(mut panel in arb_panel(3), slot in 0usize..3) {
        panel[slot] = ExpertResponseRecord {
            expert_id: "veto".to_string(),
            verdict: ExpertVerdict::Deny,
            confidence: TAU_DENY,
        };
        prop_assert_eq!(
            consensus(&panel, 3, TAU_APPROVE, TAU_DENY),
            DelegationVerdict::Deny
        );
    }

    /// An approve verdict implies a confident majority approved.
    #[test]
    fn prop_approve_requires_majority(panel in arb_panel(3)) {
        if consensus(&panel, 3, TAU_APPROVE, TAU_DENY) == DelegationVerdict::Approve {
            let confident = panel
                .iter()
                .filter(|r| r.verdict == ExpertVerdict::Approve && r.confidence >= TAU_APPROVE)
                .count();
            prop_assert!(confident >= 2, "approved with only {confident} confident votes");
        }
    }

    /// Panels of nothing but abstentions fail closed, for every panel size.
    #[test]
    fn prop_abstain_panels_fail_closed(n in prop::sample::select(vec![1usize, 3, 5])) {
        let panel: Vec<ExpertResponseRecord> = (0..n)
            .map(|i| ExpertResponseRecord {
                expert_id: format!("e{i}"),
                verdict: ExpertVerdict::Abstain,
                confidence: 0.0,
            })
            .collect();
        prop_assert_eq!(
            consensus(&panel, n, TAU_APPROVE, TAU_DENY),
            DelegationVerdict::Deny
        );
    }

    /// The rule is a pure function: same input, same verdict.
    #[test]
    fn prop_consensus_is_deterministic(panel in arb_panel(5)) {
        let first = consensus(&panel, 5, TAU_APPROVE, TAU_DENY);
        let second = consensus(&panel, 5, TAU_APPROVE, TAU_DENY);
        prop_assert_eq!(first, second);
    }

    /// Exactly one terminal verdict, and it is never a tie toward approve:
    /// without a confident approving majority the verdict cannot be approve.
    #[test]
    fn prop_ties_break_toward_deny(panel in arb_panel(3)) {
        let confident_approvals = panel
            .iter()
            .filter(|r| r.verdict == ExpertVerdict::Approve && r.confidence >= TAU_APPROVE)
            .count();
        if confident_approvals < 2 {
            prop_assert_ne!(
                consensus(&panel, 3, TAU_APPROVE, TAU_DENY),
                DelegationVerdict::Approve
            );
        }
    }
}
