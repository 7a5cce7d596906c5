//! Core types and IDs for the linkage protocol.
//!
//! Identifiers are newtype wrappers over the opaque strings the matching engine
//! and the orchestration layer hand out. Collections are `BTree*` so every
//! iteration (pair enumeration, serialisation, sorting by index) is deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Participant identifier, unique for the lifetime of one protocol run.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque token the matching engine issues for one submitted record (node-local session).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Pseudonym(pub String);

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the coordinator's engine assigns when it re-resolves blinded fields.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct GlobalId(pub String);

impl From<&str> for GlobalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 0-based ordinal of a record within a node's submission order.
pub type RecordIndex = usize;

/// Field name → raw value of one local row. Never leaves the node.
pub type RecordFields = BTreeMap<String, String>;

/// Field name → opaque blinded representation returned by the engine.
pub type BlindedFields = BTreeMap<String, serde_json::Value>;

/// One row of a node's local dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRecord {
    pub index: RecordIndex,
    pub fields: RecordFields,
}

impl LocalRecord {
    /// Projection onto `keep` fields. Missing fields are sent as empty strings.
    pub fn retained(&self, keep: &[String]) -> RecordFields {
        keep.iter()
            .map(|k| (k.clone(), self.fields.get(k).cloned().unwrap_or_default()))
            .collect()
    }
}

/// Unit exchanged from node to coordinator in round 1.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexedBlindedRecord {
    pub index: RecordIndex,
    pub fields: BlindedFields,
}

/// Pseudonym → local index, built while submitting. Later submissions overwrite.
pub type PseudonymIndexMap = BTreeMap<Pseudonym, RecordIndex>;

/// Local index → resolved global identifier, per node.
pub type NodeMatchMap = BTreeMap<RecordIndex, GlobalId>;

/// Partner node → local indices that linked with that partner.
pub type PartnerSlice = BTreeMap<NodeId, BTreeSet<RecordIndex>>;

/// Per-node partner slices for the whole federation.
pub type NodeSlices = BTreeMap<NodeId, PartnerSlice>;

/// Outcome counts of one submission pass against a matching engine.
///
/// `excluded` counts records that were linked but could not be carried forward
/// (e.g. blinded fields missing from the read-back).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmissionStats {
    pub submitted: usize,
    pub linked: usize,
    pub unresolved_duplicates: usize,
    pub rejected: usize,
    pub excluded: usize,
}

impl SubmissionStats {
    /// Records that left the pass with a usable result.
    pub fn carried(&self) -> usize {
        self.linked.saturating_sub(self.excluded)
    }
}
