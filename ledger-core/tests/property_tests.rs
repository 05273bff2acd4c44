//! Property-based tests for outbox and ledger invariants
//!
//! - At most one ledger entry per request id, however often it is committed
//! - The ledger stays hash-chained from genesis
//! - A terminal outcome is never overwritten

use ledger_core::{verify_chain, Claim, MemoryStore, OutboxStore, SettledTransfer};
use proptest::prelude::*;
use protocol_core::{ErrorKind, NodeId, RequestId, SettlementOutcome, SettlementRequest};
use std::collections::HashMap;

/// One submission: request id, whether it settles, how often it is committed
fn submission_strategy() -> impl Strategy<Value = (u64, bool, usize)> {
    (1u64..40, any::<bool>(), 1usize..4)
}

fn request(id: u64, amount: u64) -> SettlementRequest {
    SettlementRequest::new(RequestId::new(id), "A".into(), "D".into(), amount)
}

fn path() -> Vec<NodeId> {
    vec!["A".into(), "B".into(), "D".into()]
}

fn transfer(id: u64, amount: u64) -> SettledTransfer {
    SettledTransfer {
        request_id: RequestId::new(id),
        origin: "A".into(),
        destination: "D".into(),
        amount,
        path: path(),
        total_fee_bps: 20,
        total_latency_ms: 7,
        rerouted: false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: one entry per settled request id; chain intact
    #[test]
    fn one_entry_per_settled_request(
        submissions in prop::collection::vec(submission_strategy(), 1..60),
        amount in 1u64..1_000_000,
    ) {
        let store = MemoryStore::new();
        let mut first_outcome: HashMap<u64, SettlementOutcome> = HashMap::new();

        for (id, settles, commits) in submissions {
            match store.claim(&request(id, amount)).unwrap() {
                Claim::Acquired => {}
                Claim::Terminal(outcome) => {
                    // Resubmission sees exactly what was first recorded
                    prop_assert_eq!(Some(&outcome), first_outcome.get(&id));
                    continue;
                }
                other => prop_assert!(false, "unexpected claim {:?}", other),
            }

            for _ in 0..commits {
                let (outcome, settled) = if settles {
                    (
                        SettlementOutcome::completed(RequestId::new(id), path(), 20, 7),
                        Some(transfer(id, amount)),
                    )
                } else {
                    (
                        SettlementOutcome::failed(
                            RequestId::new(id),
                            ErrorKind::PathNotFound,
                            "no path",
                            Vec::new(),
                        ),
                        None,
                    )
                };
                let stored = store.commit(RequestId::new(id), outcome, settled).unwrap();
                let first = first_outcome.entry(id).or_insert_with(|| stored.clone());
                prop_assert_eq!(&stored, first);
            }
        }

        let entries = store.ledger_entries().unwrap();
        let settled = first_outcome.values().filter(|o| o.is_success()).count();
        prop_assert_eq!(entries.len(), settled);
        prop_assert!(verify_chain(&entries).is_ok());

        for (id, outcome) in &first_outcome {
            let entry = store.ledger_entry_for(RequestId::new(*id)).unwrap();
            prop_assert_eq!(entry.map(|e| e.entry_id), outcome.ledger_entry_id);
        }
    }

    /// Property: tampering with any settled amount breaks the chain
    #[test]
    fn tampering_is_detected(
        amounts in prop::collection::vec(1u64..1_000_000, 1..20),
        victim in any::<prop::sample::Index>(),
    ) {
        let store = MemoryStore::new();
        for (i, amount) in amounts.iter().enumerate() {
            let id = i as u64 + 1;
            store.claim(&request(id, *amount)).unwrap();
            let outcome = SettlementOutcome::completed(RequestId::new(id), path(), 20, 7);
            store.commit(RequestId::new(id), outcome, Some(transfer(id, *amount))).unwrap();
        }

        let mut entries = store.ledger_entries().unwrap();
        prop_assert!(verify_chain(&entries).is_ok());

        let i = victim.index(entries.len());
        entries[i].transfer.amount += 1;
        prop_assert!(verify_chain(&entries).is_err());
    }
}
