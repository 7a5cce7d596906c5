//! Node agent: one per participant.
//!
//! Round 0 it waits for config. Round 1 it starts its own engine, submits every
//! local record (retained fields only), reads back the blinded fields for the
//! pseudonyms it received and reports them re-keyed by local index, sorted
//! ascending. Round 2 it persists the partner slice it was sent and releases
//! the engine.

use log::{info, warn};
use std::collections::BTreeMap;

use crate::dataset::LocalDataset;
use crate::engine_client::{HealthPolicy, MatchingEngineClient, SubmitOutcome, TokenRequest};
use crate::error::{ProtocolError, Result};
use crate::lifecycle::{EngineLease, EngineProvision};
use crate::persistence::{ResultStore, RESULT_TAG};
use crate::round::{ConfigPayload, CoordinatorMessage, LinkageSummary, NodeReport, RoundPhase};
use crate::types::{
    BlindedFields, IndexedBlindedRecord, NodeId, PartnerSlice, PseudonymIndexMap, RecordIndex,
    SubmissionStats,
};

pub struct NodeAgent {
    id: NodeId,
    dataset: LocalDataset,
    client: MatchingEngineClient,
    provision: EngineProvision,
    health: HealthPolicy,
    store: Box<dyn ResultStore>,
    phase: RoundPhase,
    lease: Option<EngineLease>,
    pseudonyms: PseudonymIndexMap,
    stats: SubmissionStats,
    summary: Option<LinkageSummary>,
}

impl NodeAgent {
    /// Agent against an externally managed engine with the default health policy.
    pub fn new(
        id: NodeId,
        dataset: LocalDataset,
        client: MatchingEngineClient,
        store: impl ResultStore + 'static,
    ) -> Self {
        Self {
            id,
            dataset,
            client,
            provision: EngineProvision::External,
            health: HealthPolicy::default(),
            store: Box::new(store),
            phase: RoundPhase::ConfigPending,
            lease: None,
            pseudonyms: PseudonymIndexMap::new(),
            stats: SubmissionStats::default(),
            summary: None,
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

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn stats(&self) -> SubmissionStats {
        self.stats
    }

    /// Final summary, once the coordinator has sent it.
    pub fn summary(&self) -> Option<&LinkageSummary> {
        self.summary.as_ref()
    }

    /// Handles one round. `inbound` is what the coordinator sent last round.
    pub async fn handle(&mut self, inbound: Option<CoordinatorMessage>) -> Result<NodeReport> {
        match (self.phase, inbound) {
            (RoundPhase::ConfigPending, None) => Ok(NodeReport::Ready),
            (RoundPhase::ConfigPending, Some(CoordinatorMessage::Config(payload))) => {
                info!("node={} config received", self.id);
                self.phase = RoundPhase::SubmitAndMatch;
                match self.submit_round(&payload).await {
                    Ok(report) => Ok(report),
                    Err(e) => {
                        warn!("node={} round failed: {}", self.id, e);
                        self.release_engine();
                        Err(e)
                    }
                }
            }
            (RoundPhase::SubmitAndMatch, Some(CoordinatorMessage::MatchSlice(slice))) => {
                self.phase = RoundPhase::Finalize;
                self.finalize(slice)
            }
            (RoundPhase::Finalize, Some(CoordinatorMessage::Completion(summary))) => {
                info!("node={} run complete total={}", self.id, summary.total());
                self.summary = Some(summary);
                self.phase = RoundPhase::Done;
                Ok(NodeReport::Finished)
            }
            (phase, inbound) => Err(ProtocolError::UnexpectedMessage {
                phase,
                message: inbound.as_ref().map(|m| m.kind()).unwrap_or("no message"),
            }),
        }
    }

    async fn submit_round(&mut self, payload: &ConfigPayload) -> Result<NodeReport> {
        self.lease = Some(EngineLease::acquire(&self.provision, &payload.engine)?);
        self.client.wait_until_healthy(self.health).await?;

        let keep = payload.retained_fields();
        self.submit_records(&keep).await?;
        let records = self.retrieve_blinded(payload.result_fields.clone()).await;
        self.stats.excluded = self.stats.linked.saturating_sub(records.len());
        if self.stats.excluded > 0 {
            warn!("node={} excluded={} records without blinded fields", self.id, self.stats.excluded);
        }
        info!(
            "node={} submitted={} linked={} unresolved_duplicates={} rejected={} reported={}",
            self.id,
            self.stats.submitted,
            self.stats.linked,
            self.stats.unresolved_duplicates,
            self.stats.rejected,
            records.len()
        );
        Ok(NodeReport::Submission {
            records,
            stats: self.stats,
        })
    }

    /// Submits every local record; per-record failures are counted, not fatal.
    async fn submit_records(&mut self, keep: &[String]) -> Result<()> {
        let token = self
            .client
            .session_token(&TokenRequest::add_patient(self.dataset.len()))
            .await?;
        let mut stats = SubmissionStats::default();
        let mut pseudonyms = PseudonymIndexMap::new();
        for record in self.dataset.records() {
            stats.submitted += 1;
            match self.client.add_patient(&token, &record.retained(keep)).await {
                Ok(SubmitOutcome::Linked(pseudonym)) => {
                    stats.linked += 1;
                    if let Some(previous) = pseudonyms.insert(pseudonym, record.index) {
                        warn!(
                            "node={} index={} shares a pseudonym with index={}; keeping the later one",
                            self.id, record.index, previous
                        );
                    }
                }
                Ok(SubmitOutcome::PossibleDuplicate) => {
                    stats.unresolved_duplicates += 1;
                    warn!("node={} index={} possible duplicate left unresolved", self.id, record.index);
                }
                Err(e) => {
                    stats.rejected += 1;
                    warn!("node={} index={} submission failed: {}", self.id, record.index, e);
                }
            }
        }
        self.pseudonyms = pseudonyms;
        self.stats = stats;
        Ok(())
    }

    /// Reads blinded fields for every known pseudonym in one batch and re-keys
    /// them by local index, ascending. Entries that cannot be attributed are dropped.
    async fn retrieve_blinded(&self, result_fields: Vec<String>) -> Vec<IndexedBlindedRecord> {
        if self.pseudonyms.is_empty() {
            return Vec::new();
        }
        let patients = async {
            let request = TokenRequest::read_patients(self.pseudonyms.keys(), result_fields)?;
            let token = self.client.session_token(&request).await?;
            self.client.read_patients(&token).await
        }
        .await;
        let patients = match patients {
            Ok(p) => p,
            Err(e) => {
                warn!("node={} blinded field retrieval failed: {}", self.id, e);
                return Vec::new();
            }
        };
        let mut by_index: BTreeMap<RecordIndex, BlindedFields> = BTreeMap::new();
        for patient in patients {
            let index = patient
                .pseudonym()
                .and_then(|p| self.pseudonyms.get(&p).copied());
            match index {
                Some(index) if !patient.fields.is_empty() => {
                    by_index.insert(index, patient.fields);
                }
                Some(index) => warn!("node={} index={} returned without fields", self.id, index),
                None => warn!("node={} read-back entry matches no local pseudonym", self.id),
            }
        }
        by_index
            .into_iter()
            .map(|(index, fields)| IndexedBlindedRecord { index, fields })
            .collect()
    }

    fn finalize(&mut self, slice: PartnerSlice) -> Result<NodeReport> {
        info!("node={} persisting slice partners={}", self.id, slice.len());
        let saved = self.store.save(RESULT_TAG, &slice);
        self.release_engine();
        saved?;
        Ok(NodeReport::Finished)
    }

    fn release_engine(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            if let Err(e) = lease.release() {
                warn!("node={} engine release failed: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryResultStore;

    fn agent() -> NodeAgent {
        NodeAgent::new(
            NodeId::new("A"),
            LocalDataset::default(),
            MatchingEngineClient::new("http://127.0.0.1:9", "k"),
            InMemoryResultStore::new(),
        )
    }

    #[tokio::test]
    async fn first_round_without_message_is_ready() {
        let mut node = agent();
        assert_eq!(node.handle(None).await.unwrap(), NodeReport::Ready);
        assert_eq!(node.phase(), RoundPhase::ConfigPending);
    }

    #[tokio::test]
    async fn slice_before_config_is_rejected() {
        let mut node = agent();
        let err = node
            .handle(Some(CoordinatorMessage::MatchSlice(PartnerSlice::new())))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedMessage {
                phase: RoundPhase::ConfigPending,
                message: "match slice"
            }
        ));
    }

    #[tokio::test]
    async fn slice_is_persisted_verbatim() {
        let store = InMemoryResultStore::new();
        let mut node = NodeAgent::new(
            NodeId::new("A"),
            LocalDataset::default(),
            MatchingEngineClient::new("http://127.0.0.1:9", "k"),
            store.clone(),
        );
        node.phase = RoundPhase::SubmitAndMatch;
        let mut slice = PartnerSlice::new();
        slice.insert(NodeId::new("B"), [2, 5].into_iter().collect());
        let report = node
            .handle(Some(CoordinatorMessage::MatchSlice(slice.clone())))
            .await
            .unwrap();
        assert_eq!(report, NodeReport::Finished);
        assert_eq!(node.phase(), RoundPhase::Finalize);
        assert_eq!(store.get(RESULT_TAG), Some(slice));
    }
}
