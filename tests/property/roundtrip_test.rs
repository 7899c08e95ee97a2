// tests/property/roundtrip_test.rs

//! Round-trip properties: license strings, hostlists, and the persisted
//! accounting queue.

use lodestar::core::agent::persist::{pack_queue, unpack_queue};
use lodestar::core::agent::{DbdMessage, DbdRpcType};
use lodestar::core::license::{license_list_to_string, parse_license_spec};
use lodestar::core::types::hostlist;
use proptest::prelude::*;

fn license_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}".prop_map(|s| s)
}

fn rpc_type() -> impl Strategy<Value = DbdRpcType> {
    prop_oneof![
        Just(DbdRpcType::RegisterCtld),
        Just(DbdRpcType::ClusterTres),
        Just(DbdRpcType::JobComplete),
        Just(DbdRpcType::NodeStateUpdate),
        Just(DbdRpcType::JobStart),
        Just(DbdRpcType::StepComplete),
        Just(DbdRpcType::StepStart),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    // string_to_list then list_to_string is the identity on normalized
    // input: unique names, explicit counts, comma separated.
    #[test]
    fn license_string_round_trip(
        entries in prop::collection::btree_map(license_name(), 1u32..100, 1..8)
    ) {
        let normalized = entries
            .iter()
            .map(|(name, count)| format!("{name}:{count}"))
            .collect::<Vec<_>>()
            .join(",");
        let parsed = parse_license_spec(&normalized).unwrap();
        prop_assert_eq!(license_list_to_string(&parsed), normalized);
    }

    #[test]
    fn license_duplicates_accumulate(
        name in license_name(),
        counts in prop::collection::vec(1u32..50, 2..6)
    ) {
        let spec = counts
            .iter()
            .map(|c| format!("{name}:{c}"))
            .collect::<Vec<_>>()
            .join(",");
        let parsed = parse_license_spec(&spec).unwrap();
        prop_assert_eq!(parsed.len(), 1);
        prop_assert_eq!(parsed[0].count, counts.iter().sum::<u32>());
    }

    #[test]
    fn hostlist_round_trip(
        indices in prop::collection::btree_set(1u64..500, 1..40)
    ) {
        let names: Vec<String> = indices.iter().map(|i| format!("n{i}")).collect();
        let expr = hostlist::compress(&names);
        prop_assert_eq!(hostlist::expand(&expr).unwrap(), names);
    }

    // load(save(Q)) equals Q minus the registration messages.
    #[test]
    fn agent_queue_round_trip(
        msgs in prop::collection::vec((rpc_type(), 0u32..10_000), 0..32)
    ) {
        let queue: Vec<DbdMessage> = msgs
            .iter()
            .map(|(t, v)| DbdMessage::new(*t, serde_json::json!({"v": v})))
            .collect();
        let expected: Vec<&DbdMessage> = queue
            .iter()
            .filter(|m| m.rpc_type != DbdRpcType::RegisterCtld)
            .collect();

        let restored = unpack_queue(pack_queue(&queue)).unwrap();
        prop_assert_eq!(restored.len(), expected.len());
        for (got, want) in restored.iter().zip(expected) {
            prop_assert_eq!(got.rpc_type, want.rpc_type);
            prop_assert_eq!(&got.payload, &want.payload);
        }
    }
}
