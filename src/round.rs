//! Round lifecycle: phases, typed round messages, and the coordinator's run state.
//!
//! Rounds are signalled by message variant, never by payload shape:
//!
//! | round | coordinator → node            | node → coordinator          |
//! |-------|-------------------------------|-----------------------------|
//! | 0     | [`CoordinatorMessage::Config`] | [`NodeReport::Ready`]       |
//! | 1     | [`CoordinatorMessage::MatchSlice`] | [`NodeReport::Submission`] |
//! | 2     | [`CoordinatorMessage::Completion`] | [`NodeReport::Finished`] |

use std::collections::{BTreeMap, BTreeSet};

use crate::config::EngineConfig;
use crate::types::{IndexedBlindedRecord, NodeId, PartnerSlice, SubmissionStats};

/// Number of rounds after the configuration round before the run converges.
pub const MAX_ROUNDS: u32 = 2;

/// Phase of one party within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum RoundPhase {
    ConfigPending,
    SubmitAndMatch,
    Finalize,
    Done,
}

impl RoundPhase {
    pub fn next(self) -> Self {
        match self {
            RoundPhase::ConfigPending => RoundPhase::SubmitAndMatch,
            RoundPhase::SubmitAndMatch => RoundPhase::Finalize,
            RoundPhase::Finalize | RoundPhase::Done => RoundPhase::Done,
        }
    }
}

/// Whether the run has converged once round index `iteration` is aggregated.
/// Depends on the count only, never on result content.
pub fn has_converged(iteration: u32) -> bool {
    iteration >= MAX_ROUNDS
}

/// Round-0 payload: the node-side engine config and the blinded fields to read back.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConfigPayload {
    pub engine: EngineConfig,
    pub result_fields: Vec<String>,
}

impl ConfigPayload {
    /// Ordered comparison-field names a node submits.
    pub fn retained_fields(&self) -> Vec<String> {
        self.engine.settings.retained_fields()
    }
}

/// Final report of a run: intersection counts plus every observable loss.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LinkageSummary {
    pub pairwise_counts: BTreeMap<String, usize>,
    /// Node-local submission outcomes as reported by each node.
    pub node_stats: BTreeMap<NodeId, SubmissionStats>,
    /// Outcomes of the coordinator re-resolving each node's blinded records.
    pub resolution_stats: BTreeMap<NodeId, SubmissionStats>,
    /// Nodes whose round-1 contribution was missing or failed (counted as empty).
    pub failed_nodes: BTreeSet<NodeId>,
}

impl LinkageSummary {
    pub fn total(&self) -> usize {
        self.pairwise_counts
            .get(crate::intersection::TOTAL_KEY)
            .copied()
            .unwrap_or(0)
    }

    /// Unresolved duplicates across both submission passes.
    pub fn unresolved_duplicates(&self) -> usize {
        self.node_stats
            .values()
            .chain(self.resolution_stats.values())
            .map(|s| s.unresolved_duplicates)
            .sum()
    }
}

/// Message the coordinator sends to one node.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CoordinatorMessage {
    Config(ConfigPayload),
    MatchSlice(PartnerSlice),
    Completion(LinkageSummary),
}

impl CoordinatorMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorMessage::Config(_) => "config",
            CoordinatorMessage::MatchSlice(_) => "match slice",
            CoordinatorMessage::Completion(_) => "completion",
        }
    }
}

/// What a node returns to the coordinator for one round.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum NodeReport {
    /// Round 0: waiting for config.
    Ready,
    /// Round 1: blinded records sorted by index, plus local submission outcomes.
    Submission {
        records: Vec<IndexedBlindedRecord>,
        stats: SubmissionStats,
    },
    /// The node's round failed; its contribution is treated as empty.
    Failed { reason: String },
    /// Round 2: slice persisted, resources released.
    Finished,
}

impl NodeReport {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeReport::Ready => "ready",
            NodeReport::Submission { .. } => "submission",
            NodeReport::Failed { .. } => "failure",
            NodeReport::Finished => "finished",
        }
    }
}

/// Contributions for one round. `None` means the node sent nothing.
pub type Contributions = BTreeMap<NodeId, Option<NodeReport>>;

/// Per-node tally kept across rounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeTally {
    pub rounds_reported: u32,
    pub rounds_missing: u32,
    pub records_received: usize,
}

/// Coordinator state threaded through every round handler.
#[derive(Clone, Debug, PartialEq)]
pub struct RunState {
    /// Index of the round being aggregated (0, 1, 2).
    pub iteration: u32,
    pub converged: bool,
    pub phase: RoundPhase,
    pub participants: BTreeSet<NodeId>,
    pub tallies: BTreeMap<NodeId, NodeTally>,
    pub summary: Option<LinkageSummary>,
}

impl RunState {
    pub fn new(participants: impl IntoIterator<Item = NodeId>) -> Self {
        let participants: BTreeSet<NodeId> = participants.into_iter().collect();
        Self {
            iteration: 0,
            converged: false,
            phase: RoundPhase::ConfigPending,
            tallies: participants
                .iter()
                .map(|n| (n.clone(), NodeTally::default()))
                .collect(),
            participants,
            summary: None,
        }
    }

    /// Records who reported this round. Nodes outside the participant set are ignored.
    pub fn record_round(&mut self, contributions: &Contributions) {
        for node in &self.participants {
            let tally = self.tallies.entry(node.clone()).or_default();
            match contributions.get(node) {
                Some(Some(report)) => {
                    tally.rounds_reported += 1;
                    if let NodeReport::Submission { records, .. } = report {
                        tally.records_received += records.len();
                    }
                }
                _ => tally.rounds_missing += 1,
            }
        }
    }

    /// Closes the current round: moves the phase on and either converges or
    /// opens the next round.
    pub fn complete_round(mut self) -> Self {
        self.phase = self.phase.next();
        if has_converged(self.iteration) {
            self.converged = true;
        } else {
            self.iteration += 1;
        }
        self
    }

    pub fn has_converged(&self) -> bool {
        self.converged
    }
}
