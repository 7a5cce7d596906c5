//! # Federated Linkage
//!
//! Privacy-preserving record linkage across independent data-holding nodes.
//! No party sees another's raw records: each node links its records through its
//! own matching engine and hands the coordinator only salted, bigram-blinded
//! fields keyed by local row index. The coordinator re-links those through its
//! own engine, intersects the resulting identifiers, and tells each node which
//! of its rows also exist at each partner.
//!
//! ## Entry points
//!
//! - [`NodeAgent::handle`] and [`Coordinator::aggregate`] implement one round each;
//!   the coordinator's [`RunState`] is passed in and returned every round.
//! - [`Federation::run`] drives a whole run in-process.
//! - [`intersect`] is the pure intersection step.
//!
//! ## Example
//!
//! ```rust
//! use federated_linkage::{intersect, GlobalId, NodeId, NodeMatchMap};
//! use std::collections::BTreeMap;
//!
//! let a: NodeMatchMap = [(0, GlobalId::from("g1")), (1, GlobalId::from("g2"))].into();
//! let b: NodeMatchMap = [(4, GlobalId::from("g2"))].into();
//! let mut all = BTreeMap::new();
//! all.insert(NodeId::new("A"), a);
//! all.insert(NodeId::new("B"), b);
//!
//! let result = intersect(&all);
//! assert_eq!(result.pairwise_counts["A:B"], 1);
//! assert_eq!(result.total(), 1);
//! assert!(result.slice_for(&NodeId::new("A"))[&NodeId::new("B")].contains(&1));
//! ```

pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod engine_client;
pub mod error;
pub mod federation;
pub mod intersection;
pub mod lifecycle;
pub mod node;
pub mod persistence;
pub mod round;
pub mod stub_engine;
pub mod synthetic;
pub mod types;

pub use config::{EngineConfig, EngineDeployment, LinkageSettings, RuntimeSettings};
pub use coordinator::{Coordinator, Outbox};
pub use dataset::LocalDataset;
pub use engine_client::{HealthPolicy, MatchingEngineClient, SubmitOutcome, TokenRequest};
pub use error::{ProtocolError, Result};
pub use federation::Federation;
pub use intersection::{intersect, merge_slices, IntersectionResult, TOTAL_KEY};
pub use lifecycle::{EngineLease, EngineProvision};
pub use node::NodeAgent;
pub use persistence::{FileResultStore, InMemoryResultStore, ResultStore, RESULT_TAG};
pub use round::{
    has_converged, ConfigPayload, Contributions, CoordinatorMessage, LinkageSummary, NodeReport,
    RoundPhase, RunState,
};
pub use stub_engine::StubEngine;
pub use synthetic::{generate as generate_cohort, Cohort, CohortConfig};
pub use types::{
    GlobalId, IndexedBlindedRecord, LocalRecord, NodeId, NodeMatchMap, PartnerSlice, Pseudonym,
    SubmissionStats,
};
