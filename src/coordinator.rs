//! Coordinator: one per run.
//!
//! Holds the two engine-config variants derived from one set of linkage
//! settings and its own engine instance. Each call to [`Coordinator::aggregate`]
//! takes the [`RunState`] and one round of node contributions and returns the
//! updated state plus one message per participant:
//!
//! - round 0: the node-side config to everyone;
//! - round 1: re-submits every node's blinded records through its own engine to
//!   obtain global identifiers, intersects, and sends each node its own slice;
//! - round 2: sends the final [`LinkageSummary`] to everyone.

use log::{error, info, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{generate_salt, EngineConfig, EngineDeployment, LinkageSettings};
use crate::engine_client::{HealthPolicy, MatchingEngineClient, SubmitOutcome, TokenRequest};
use crate::error::{ProtocolError, Result};
use crate::intersection::intersect;
use crate::lifecycle::{EngineLease, EngineProvision};
use crate::round::{
    ConfigPayload, Contributions, CoordinatorMessage, LinkageSummary, NodeReport, RoundPhase,
    RunState,
};
use crate::types::{GlobalId, IndexedBlindedRecord, NodeId, NodeMatchMap, SubmissionStats};

/// Messages for one round, keyed by recipient.
pub type Outbox = BTreeMap<NodeId, CoordinatorMessage>;

pub struct Coordinator {
    node_payload: ConfigPayload,
    engine_config: EngineConfig,
    client: MatchingEngineClient,
    provision: EngineProvision,
    health: HealthPolicy,
    lease: Option<EngineLease>,
}

impl Coordinator {
    /// Derives both config variants from `settings`, with a fresh salt for the nodes.
    pub fn new(
        settings: &LinkageSettings,
        deployment: &EngineDeployment,
        client: MatchingEngineClient,
    ) -> Self {
        let node_engine = EngineConfig::for_nodes(settings, deployment, generate_salt());
        Self {
            node_payload: ConfigPayload {
                engine: node_engine,
                result_fields: settings.result_fields(),
            },
            engine_config: EngineConfig::for_coordinator(settings, deployment),
            client,
            provision: EngineProvision::External,
            health: HealthPolicy::default(),
            lease: None,
        }
    }

    pub fn with_provision(mut self, provision: EngineProvision) -> Self {
        self.provision = provision;
        self
    }

    pub fn with_health_policy(mut self, health: HealthPolicy) -> Self {
        self.health = health;
        self
    }

    /// Config handed to every node in round 0.
    pub fn node_payload(&self) -> &ConfigPayload {
        &self.node_payload
    }

    /// Config of the coordinator's own engine.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    /// Starts the coordinator's engine ahead of round 1. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.lease.is_none() {
            self.lease = Some(EngineLease::acquire(&self.provision, &self.engine_config)?);
        }
        Ok(())
    }

    /// Runs one aggregation round.
    ///
    /// An error means the round failed and the run must not advance; the
    /// coordinator's engine is released on that path too.
    pub async fn aggregate(
        &mut self,
        state: RunState,
        mut contributions: Contributions,
    ) -> Result<(RunState, Outbox)> {
        let mut state = state;
        state.record_round(&contributions);
        info!(
            "coordinator round={} phase={:?} contributions={}",
            state.iteration,
            state.phase,
            contributions.values().filter(|c| c.is_some()).count()
        );
        let outbox = match state.phase {
            RoundPhase::ConfigPending => state
                .participants
                .iter()
                .map(|n| (n.clone(), CoordinatorMessage::Config(self.node_payload.clone())))
                .collect(),
            RoundPhase::SubmitAndMatch => {
                let outcome = self.match_round(&mut state, &mut contributions).await;
                self.release_engine();
                if let Err(e) = &outcome {
                    error!("coordinator matching round failed: {}", e);
                }
                outcome?
            }
            RoundPhase::Finalize => self.completion_round(&state, &contributions),
            RoundPhase::Done => {
                return Err(ProtocolError::UnexpectedMessage {
                    phase: RoundPhase::Done,
                    message: "contributions",
                })
            }
        };
        Ok((state.complete_round(), outbox))
    }

    async fn match_round(
        &mut self,
        state: &mut RunState,
        contributions: &mut Contributions,
    ) -> Result<Outbox> {
        let mut submissions: BTreeMap<NodeId, Vec<IndexedBlindedRecord>> = BTreeMap::new();
        let mut node_stats = BTreeMap::new();
        let mut failed_nodes = BTreeSet::new();
        for node in &state.participants {
            match contributions.remove(node).flatten() {
                Some(NodeReport::Submission { records, stats }) => {
                    node_stats.insert(node.clone(), stats);
                    submissions.insert(node.clone(), records);
                }
                Some(NodeReport::Failed { reason }) => {
                    warn!("node={} failed its round: {}; contribution counted as empty", node, reason);
                    failed_nodes.insert(node.clone());
                    submissions.insert(node.clone(), Vec::new());
                }
                Some(other) => {
                    warn!("node={} sent {} in the matching round; counted as empty", node, other.kind());
                    failed_nodes.insert(node.clone());
                    submissions.insert(node.clone(), Vec::new());
                }
                None => {
                    warn!("node={} sent nothing; contribution counted as empty", node);
                    failed_nodes.insert(node.clone());
                    submissions.insert(node.clone(), Vec::new());
                }
            }
        }
        for stranger in contributions.keys() {
            warn!("ignoring contribution from non-participant node={}", stranger);
        }

        let allowed_uses: usize = submissions.values().map(|r| r.len()).sum();
        let mut all_matches: BTreeMap<NodeId, NodeMatchMap> = BTreeMap::new();
        let mut resolution_stats = BTreeMap::new();
        if allowed_uses > 0 {
            self.start()?;
            self.client.wait_until_healthy(self.health).await?;
            let token = self
                .client
                .session_token(&TokenRequest::add_patient(allowed_uses))
                .await?;
            for (node, records) in &submissions {
                let (matches, stats) = self.resolve(&token, node, records).await;
                all_matches.insert(node.clone(), matches);
                resolution_stats.insert(node.clone(), stats);
            }
        } else {
            warn!("no blinded records received; skipping resolution");
            for node in submissions.keys() {
                all_matches.insert(node.clone(), NodeMatchMap::new());
                resolution_stats.insert(node.clone(), SubmissionStats::default());
            }
        }

        let intersection = intersect(&all_matches);
        info!(
            "coordinator intersection total={} pairs={}",
            intersection.total(),
            intersection.pairwise_counts.len().saturating_sub(1)
        );
        let outbox = state
            .participants
            .iter()
            .map(|n| (n.clone(), CoordinatorMessage::MatchSlice(intersection.slice_for(n))))
            .collect();
        state.summary = Some(LinkageSummary {
            pairwise_counts: intersection.pairwise_counts,
            node_stats,
            resolution_stats,
            failed_nodes,
        });
        Ok(outbox)
    }

    /// Re-submits one node's blinded records; returns `index → GlobalId`.
    async fn resolve(
        &self,
        token: &str,
        node: &NodeId,
        records: &[IndexedBlindedRecord],
    ) -> (NodeMatchMap, SubmissionStats) {
        let mut matches = NodeMatchMap::new();
        let mut stats = SubmissionStats::default();
        for record in records {
            stats.submitted += 1;
            match self.client.add_patient(token, &record.fields).await {
                Ok(SubmitOutcome::Linked(id)) => {
                    stats.linked += 1;
                    matches.insert(record.index, GlobalId(id.0));
                }
                Ok(SubmitOutcome::PossibleDuplicate) => {
                    stats.unresolved_duplicates += 1;
                    warn!("node={} index={} possible match counted as non-match", node, record.index);
                }
                Err(e) => {
                    stats.rejected += 1;
                    warn!("node={} index={} resolution failed: {}", node, record.index, e);
                }
            }
        }
        info!(
            "node={} resolved={} unresolved_duplicates={} rejected={}",
            node, stats.linked, stats.unresolved_duplicates, stats.rejected
        );
        (matches, stats)
    }

    fn completion_round(&self, state: &RunState, contributions: &Contributions) -> Outbox {
        for node in &state.participants {
            match contributions.get(node) {
                Some(Some(NodeReport::Finished)) => {}
                Some(Some(other)) => warn!("node={} sent {} instead of finishing", node, other.kind()),
                _ => warn!("node={} did not confirm completion", node),
            }
        }
        let summary = state.summary.clone().unwrap_or_default();
        info!("coordinator finished total={}", summary.total());
        state
            .participants
            .iter()
            .map(|n| (n.clone(), CoordinatorMessage::Completion(summary.clone())))
            .collect()
    }

    fn release_engine(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            if let Err(e) = lease.release() {
                warn!("coordinator engine release failed: {}", e);
            }
        }
    }
}
