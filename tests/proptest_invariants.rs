//! Property-based invariant tests for the intersection step.
//!
//! Uses proptest to generate per-node `index → GlobalId` maps and asserts:
//! pairwise results do not depend on the other nodes, the global count never
//! exceeds any pairwise count, slices agree with counts, and slice merging is
//! idempotent and associative.

use federated_linkage::{intersect, merge_slices, GlobalId, NodeId, NodeMatchMap, TOTAL_KEY};
use federated_linkage::types::NodeSlices;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Up to 5 nodes, each with up to 20 records drawn from a pool of 15 global ids.
fn all_matches() -> impl Strategy<Value = BTreeMap<NodeId, NodeMatchMap>> {
    prop::collection::vec(prop::collection::btree_map(0usize..40, 0u8..15, 0..20), 1..5).prop_map(
        |nodes| {
            nodes
                .into_iter()
                .enumerate()
                .map(|(i, m)| {
                    let id = NodeId::new(format!("node-{}", (b'a' + i as u8) as char));
                    let m = m
                        .into_iter()
                        .map(|(index, g)| (index, GlobalId(format!("g{}", g))))
                        .collect();
                    (id, m)
                })
                .collect()
        },
    )
}

fn slices() -> impl Strategy<Value = NodeSlices> {
    prop::collection::btree_map(
        0u8..3,
        prop::collection::btree_map(0u8..3, prop::collection::btree_set(0usize..10, 0..5), 0..3),
        0..3,
    )
    .prop_map(|m| {
        m.into_iter()
            .map(|(n, partners)| {
                let partners = partners
                    .into_iter()
                    .map(|(p, set)| (NodeId::new(format!("p{}", p)), set))
                    .collect();
                (NodeId::new(format!("n{}", n)), partners)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_pair_counts_ignore_other_nodes(matches in all_matches()) {
        let result = intersect(&matches);
        let nodes: Vec<&NodeId> = matches.keys().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let pair: BTreeMap<NodeId, NodeMatchMap> = [*a, *b]
                    .into_iter()
                    .map(|n| (n.clone(), matches[n].clone()))
                    .collect();
                let alone = intersect(&pair);
                prop_assert_eq!(result.pair_count(a, b), alone.pair_count(a, b));
                prop_assert_eq!(result.slice_for(a)[*b].clone(), alone.slice_for(a)[*b].clone());
            }
        }
    }

    #[test]
    fn prop_global_count_bounded_by_every_pair(matches in all_matches()) {
        let result = intersect(&matches);
        let total = result.total();
        for (key, count) in &result.pairwise_counts {
            if key != TOTAL_KEY {
                prop_assert!(total <= *count, "total {} > {}={}", total, key, count);
            }
        }
        let expected_pairs = matches.len() * matches.len().saturating_sub(1) / 2;
        prop_assert_eq!(result.pairwise_counts.len(), expected_pairs + 1);
    }

    #[test]
    fn prop_slices_cover_every_partner_and_agree_with_ids(matches in all_matches()) {
        let result = intersect(&matches);
        for (node, own) in &matches {
            let slice = result.slice_for(node);
            prop_assert_eq!(slice.len(), matches.len() - 1);
            for (partner, indices) in &slice {
                let theirs: std::collections::BTreeSet<&GlobalId> = matches[partner].values().collect();
                for index in indices {
                    prop_assert!(theirs.contains(&own[index]));
                }
                let linked = own.values().filter(|g| theirs.contains(g)).count();
                prop_assert_eq!(indices.len(), linked);
            }
        }
    }

    #[test]
    fn prop_merge_is_idempotent(a in slices(), b in slices()) {
        let mut once = a.clone();
        merge_slices(&mut once, b.clone());
        let mut twice = once.clone();
        merge_slices(&mut twice, b);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_merge_is_associative(a in slices(), b in slices(), c in slices()) {
        let mut left = a.clone();
        merge_slices(&mut left, b.clone());
        merge_slices(&mut left, c.clone());

        let mut bc = b;
        merge_slices(&mut bc, c);
        let mut right = a;
        merge_slices(&mut right, bc);
        prop_assert_eq!(left, right);
    }
}
