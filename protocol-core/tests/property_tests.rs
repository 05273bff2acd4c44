//! Property-based tests for request ids and signatures

use proptest::prelude::*;
use protocol_core::snowflake::decompose;
use protocol_core::{
    NodeId, RequestId, RequestSigner, SettlementRequest, SignerRegistry, SnowflakeGenerator,
};

fn path_strategy() -> impl Strategy<Value = Vec<NodeId>> {
    prop::collection::hash_set("[A-Z][0-9]{1,2}", 2..7)
        .prop_map(|ids| ids.into_iter().map(NodeId::from).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: ids from one worker are strictly increasing and carry the worker id
    #[test]
    fn snowflake_ids_monotonic(worker in 0u16..1024, count in 1usize..2_000) {
        let generator = SnowflakeGenerator::new(worker).unwrap();
        let mut last: Option<RequestId> = None;
        for _ in 0..count {
            let id = generator.next_id().unwrap();
            if let Some(prev) = last {
                prop_assert!(id > prev);
            }
            prop_assert_eq!(decompose(id).worker_id, worker);
            last = Some(id);
        }
    }

    /// Property: a signature made at the origin verifies on every hop
    #[test]
    fn signature_survives_hops(path in path_strategy(), amount in 1u64..u64::MAX / 2) {
        let signer = RequestSigner::generate("origin");
        let mut registry = SignerRegistry::new();
        registry.insert("origin", signer.verifying_key());

        let source = path[0].clone();
        let destination = path[path.len() - 1].clone();
        let mut request = SettlementRequest::new(RequestId::new(42), source, destination, amount);
        signer.sign(&mut request);

        for hop in 0..path.len() - 1 {
            let hop_request = request.for_hop(&path, hop);
            prop_assert!(registry.verify(&hop_request).is_ok());

            let mut forged = hop_request;
            forged.amount += 1;
            prop_assert!(registry.verify(&forged).is_err());
        }
    }
}
