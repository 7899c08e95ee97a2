// tests/property/sort_stability_test.rs

//! Node-set ordering and feature-filter properties.

use lodestar::config::NodeDef;
use lodestar::core::sched::features::{FeatureExpr, valid_feature_counts};
use lodestar::core::sched::node_set::{NodeSet, NodeSetFlags, sched_weight};
use lodestar::core::state::NodeTable;
use lodestar::core::types::bitmap::NodeBitmap;
use proptest::prelude::*;

fn set_with(weight: u32, tag: usize) -> NodeSet {
    // The tag rides in the bitmap so the original order stays observable.
    let mut bitmap = NodeBitmap::new(64);
    bitmap.set(tag);
    NodeSet {
        cpus_per_node: 4,
        real_memory: 1024,
        weight,
        feature_bits: 1,
        node_bitmap: bitmap,
        flags: NodeSetFlags::empty(),
        sched_weight: sched_weight(weight, NodeSetFlags::empty()),
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    // Stable sort: sets with equal sched_weight keep their input order.
    #[test]
    fn node_set_sort_is_stable(weights in prop::collection::vec(1u32..6, 2..40)) {
        let mut sets: Vec<NodeSet> = weights
            .iter()
            .enumerate()
            .map(|(tag, w)| set_with(*w, tag % 64))
            .collect();
        sets.sort_by_key(|s| s.sched_weight);

        for pair in sets.windows(2) {
            prop_assert!(pair[0].sched_weight <= pair[1].sched_weight);
            if pair[0].sched_weight == pair[1].sched_weight {
                let a = pair[0].node_bitmap.first_set().unwrap();
                let b = pair[1].node_bitmap.first_set().unwrap();
                // Tags wrap at 64; only compare when the order is encoded.
                if a != b {
                    let pos_a = weights.iter().enumerate().position(|(t, _)| t % 64 == a);
                    let pos_b = weights.iter().enumerate().position(|(t, _)| t % 64 == b);
                    prop_assert!(pos_a < pos_b);
                }
            }
        }
    }

    // Reboot and flex penalties always outrank any configured weight.
    #[test]
    fn penalty_bits_dominate_weight(weight in 1u32..0xFFFF_FFFF) {
        let plain = sched_weight(weight, NodeSetFlags::empty());
        let flex = sched_weight(1, NodeSetFlags::OUTSIDE_FLEX);
        let reboot = sched_weight(1, NodeSetFlags::REBOOT);
        prop_assert!(plain < flex);
        prop_assert!(flex < reboot);
    }

    // Applying the feature filter twice yields the same bitmap as once.
    #[test]
    fn feature_filter_is_idempotent(with_feature in prop::collection::vec(prop::bool::ANY, 4..32)) {
        let mut defs = Vec::new();
        for (i, has) in with_feature.iter().enumerate() {
            defs.push(NodeDef {
                names: format!("n{i}"),
                cpus: 4,
                sockets: 1,
                cores_per_socket: 4,
                threads_per_core: 1,
                real_memory: 1024,
                tmp_disk: 0,
                weight: 1,
                features: if *has { vec!["fast".into()] } else { vec![] },
                changeable_features: vec![],
                gres: vec![],
                cloud: false,
            });
        }
        let table = NodeTable::from_defs(&defs).unwrap();
        let expr = FeatureExpr::parse("fast").unwrap();
        let all = NodeBitmap::new_full(table.len());

        let once = valid_feature_counts(&expr, &table, &all);
        let twice = valid_feature_counts(&expr, &table, &once);
        prop_assert_eq!(&once, &twice);

        let expected: Vec<usize> = with_feature
            .iter()
            .enumerate()
            .filter_map(|(i, has)| has.then_some(i))
            .collect();
        prop_assert_eq!(once.iter_ones().collect::<Vec<_>>(), expected);
    }
}
