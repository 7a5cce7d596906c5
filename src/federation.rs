//! Local driver: runs one coordinator and its nodes in-process, round by round.
//!
//! Each round every node handles the message the coordinator addressed to it
//! last round (none in round 0); a node error becomes [`NodeReport::Failed`]
//! so the coordinator counts that node as empty instead of aborting the run.
//! After convergence the completion messages are delivered and the summary
//! returned.

use log::{info, warn};
use std::collections::BTreeMap;

use crate::coordinator::{Coordinator, Outbox};
use crate::error::Result;
use crate::node::NodeAgent;
use crate::round::{Contributions, LinkageSummary, NodeReport, RunState};
use crate::types::NodeId;

pub struct Federation {
    coordinator: Coordinator,
    nodes: BTreeMap<NodeId, NodeAgent>,
}

impl Federation {
    pub fn new(coordinator: Coordinator, nodes: impl IntoIterator<Item = NodeAgent>) -> Self {
        Self {
            coordinator,
            nodes: nodes.into_iter().map(|n| (n.id().clone(), n)).collect(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeAgent> {
        self.nodes.get(id)
    }

    /// Runs rounds until the coordinator converges. A coordinator error aborts the run.
    pub async fn run(&mut self) -> Result<LinkageSummary> {
        let mut state = RunState::new(self.nodes.keys().cloned());
        let mut inbox = Outbox::new();
        loop {
            let mut contributions = Contributions::new();
            for (id, node) in self.nodes.iter_mut() {
                let report = match node.handle(inbox.remove(id)).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!("node={} round={} failed: {}", id, state.iteration, e);
                        NodeReport::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                contributions.insert(id.clone(), Some(report));
            }
            let (next, outbox) = self.coordinator.aggregate(state, contributions).await?;
            state = next;
            inbox = outbox;
            if state.has_converged() {
                break;
            }
        }
        for (id, node) in self.nodes.iter_mut() {
            if let Some(message) = inbox.remove(id) {
                if let Err(e) = node.handle(Some(message)).await {
                    warn!("node={} did not accept completion: {}", id, e);
                }
            }
        }
        let summary = state.summary.unwrap_or_default();
        info!(
            "run finished rounds={} total={} failed_nodes={}",
            state.iteration + 1,
            summary.total(),
            summary.failed_nodes.len()
        );
        Ok(summary)
    }
}
