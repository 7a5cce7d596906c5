//! Pairwise and global set intersection over resolved global identifiers.
//!
//! [`intersect`] takes every node's `index → GlobalId` map and produces the
//! pairwise counts (keyed `"A:B"` with `A < B`), the global count under
//! `"total"`, and per node the local indices that linked with each partner.
//! Pure computation; node order in the input never affects the output.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{GlobalId, NodeId, NodeMatchMap, NodeSlices, PartnerSlice};

/// Key under which the all-node intersection size is stored.
pub const TOTAL_KEY: &str = "total";

/// Result of one intersection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IntersectionResult {
    /// `"A:B"` → size of the pairwise intersection, plus `"total"`.
    pub pairwise_counts: BTreeMap<String, usize>,
    /// Node → partner → local indices present in that partner too.
    pub per_node: NodeSlices,
}

impl IntersectionResult {
    /// Size of the intersection across all nodes.
    pub fn total(&self) -> usize {
        self.pairwise_counts.get(TOTAL_KEY).copied().unwrap_or(0)
    }

    /// Count for the unordered pair `a`, `b`.
    pub fn pair_count(&self, a: &NodeId, b: &NodeId) -> Option<usize> {
        self.pairwise_counts.get(&pair_key(a, b)).copied()
    }

    /// The partner slice for `node` only; never partner-to-partner data.
    pub fn slice_for(&self, node: &NodeId) -> PartnerSlice {
        self.per_node.get(node).cloned().unwrap_or_default()
    }
}

/// `"A:B"` with the lexicographically smaller id first.
pub fn pair_key(a: &NodeId, b: &NodeId) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

fn value_set(matches: &NodeMatchMap) -> BTreeSet<&GlobalId> {
    matches.values().collect()
}

fn indices_in(matches: &NodeMatchMap, common: &BTreeSet<&GlobalId>) -> BTreeSet<usize> {
    matches
        .iter()
        .filter(|(_, id)| common.contains(id))
        .map(|(index, _)| *index)
        .collect()
}

/// Computes global and pairwise intersections for every node in `all_matches`.
///
/// Every node gets an entry in `per_node`, and every partner appears in its
/// slice even when nothing linked (empty set).
pub fn intersect(all_matches: &BTreeMap<NodeId, NodeMatchMap>) -> IntersectionResult {
    let value_sets: BTreeMap<&NodeId, BTreeSet<&GlobalId>> = all_matches
        .iter()
        .map(|(node, matches)| (node, value_set(matches)))
        .collect();

    let mut sets = value_sets.values();
    let global: BTreeSet<&GlobalId> = match sets.next() {
        Some(first) => sets.fold(first.clone(), |acc, s| acc.intersection(s).copied().collect()),
        None => BTreeSet::new(),
    };

    let mut per_node: NodeSlices = all_matches
        .keys()
        .map(|node| (node.clone(), PartnerSlice::new()))
        .collect();
    let mut pairwise_counts = BTreeMap::new();

    let nodes: Vec<&NodeId> = all_matches.keys().collect();
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            let common: BTreeSet<&GlobalId> =
                value_sets[a].intersection(&value_sets[b]).copied().collect();
            let mut pair = NodeSlices::new();
            pair.entry((*a).clone())
                .or_default()
                .insert((*b).clone(), indices_in(&all_matches[*a], &common));
            pair.entry((*b).clone())
                .or_default()
                .insert((*a).clone(), indices_in(&all_matches[*b], &common));
            merge_slices(&mut per_node, pair);
            pairwise_counts.insert(pair_key(a, b), common.len());
        }
    }
    pairwise_counts.insert(TOTAL_KEY.to_string(), global.len());

    IntersectionResult {
        pairwise_counts,
        per_node,
    }
}

/// Unions `other` into `into`, node by node and partner by partner.
///
/// Set union per `(node, partner)` cell, so the merge is associative,
/// commutative and idempotent: merging the same slices twice changes nothing.
pub fn merge_slices(into: &mut NodeSlices, other: NodeSlices) {
    for (node, partners) in other {
        let slot = into.entry(node).or_default();
        for (partner, indices) in partners {
            slot.entry(partner).or_default().extend(indices);
        }
    }
}
