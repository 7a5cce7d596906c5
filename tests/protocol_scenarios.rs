//! End-to-end runs: one coordinator and several nodes, each party with its own stub engine.

use federated_linkage::{
    generate_cohort, CohortConfig, ConfigPayload, Coordinator, CoordinatorMessage, EngineConfig,
    EngineDeployment, Federation, HealthPolicy, InMemoryResultStore, LinkageSettings,
    LinkageSummary, LocalDataset, MatchingEngineClient, NodeAgent, NodeId, NodeReport,
    PartnerSlice, RoundPhase, StubEngine, SubmitOutcome, TokenRequest, RESULT_TAG,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const KEY: &str = "changeme1";

fn fast_health() -> HealthPolicy {
    HealthPolicy {
        timeout: Duration::from_millis(300),
        interval: Duration::from_millis(20),
    }
}

async fn spawn_stub(salt: &str) -> (StubEngine, MatchingEngineClient) {
    let engine = StubEngine::new(KEY).with_salt(salt);
    let (addr, _handle) = engine.spawn("127.0.0.1:0").await.unwrap();
    (engine, MatchingEngineClient::new(format!("http://{}", addr), KEY))
}

fn person(first: &str, last: &str, year: u32) -> BTreeMap<String, String> {
    [
        ("vorname", first.to_string()),
        ("nachname", last.to_string()),
        ("geburtsname", last.to_string()),
        ("geburtstag", "12".to_string()),
        ("geburtsmonat", "3".to_string()),
        ("geburtsjahr", year.to_string()),
        ("ort", "Mainz".to_string()),
        ("plz", "55116".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

struct Harness {
    federation: Federation,
    engines: BTreeMap<NodeId, StubEngine>,
    stores: BTreeMap<NodeId, InMemoryResultStore>,
}

impl Harness {
    async fn new(datasets: Vec<(&str, LocalDataset)>) -> Self {
        let _ = env_logger::try_init();
        let (_coordinator_engine, client) = spawn_stub("").await;
        let coordinator = Coordinator::new(
            &LinkageSettings::default(),
            &EngineDeployment::default(),
            client,
        )
        .with_health_policy(fast_health());
        let salt = coordinator.node_payload().engine.salt.clone().unwrap();

        let mut engines = BTreeMap::new();
        let mut stores = BTreeMap::new();
        let mut nodes = Vec::new();
        for (id, dataset) in datasets {
            let id = NodeId::new(id);
            let (engine, client) = spawn_stub(&salt).await;
            let store = InMemoryResultStore::new();
            nodes.push(
                NodeAgent::new(id.clone(), dataset, client, store.clone())
                    .with_health_policy(fast_health()),
            );
            engines.insert(id.clone(), engine);
            stores.insert(id, store);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            federation: Federation::new(coordinator, nodes),
            engines,
            stores,
        }
    }

    async fn run(&mut self) -> LinkageSummary {
        self.federation.run().await.unwrap()
    }

    fn slice(&self, node: &str) -> PartnerSlice {
        self.stores[&NodeId::new(node)].get(RESULT_TAG).unwrap()
    }
}

fn indices(items: &[usize]) -> BTreeSet<usize> {
    items.iter().copied().collect()
}

#[tokio::test]
async fn three_nodes_sharing_one_record() {
    let shared = person("Anna", "Meier", 1980);
    let mut harness = Harness::new(vec![
        ("A", LocalDataset::from_rows([shared.clone(), person("Ben", "Roth", 1975)])),
        ("B", LocalDataset::from_rows([person("Clara", "Weber", 1990), shared.clone()])),
        ("C", LocalDataset::from_rows([shared])),
    ])
    .await;
    let summary = harness.run().await;

    assert_eq!(summary.total(), 1);
    for pair in ["A:B", "A:C", "B:C"] {
        assert_eq!(summary.pairwise_counts[pair], 1, "{pair}");
    }
    assert!(summary.failed_nodes.is_empty());

    let a = harness.slice("A");
    assert_eq!(a[&NodeId::new("B")], indices(&[0]));
    assert_eq!(a[&NodeId::new("C")], indices(&[0]));
    let b = harness.slice("B");
    assert_eq!(b[&NodeId::new("A")], indices(&[1]));
    assert_eq!(b[&NodeId::new("C")], indices(&[1]));
    assert!(!b.contains_key(&NodeId::new("B")));

    let node = harness.federation.node(&NodeId::new("C")).unwrap();
    assert_eq!(node.phase(), RoundPhase::Done);
    assert_eq!(node.summary(), Some(&summary));
}

#[tokio::test]
async fn disjoint_nodes_link_nothing() {
    let mut harness = Harness::new(vec![
        ("A", LocalDataset::from_rows([person("Anna", "Meier", 1980)])),
        ("B", LocalDataset::from_rows([person("Ben", "Roth", 1975)])),
    ])
    .await;
    let summary = harness.run().await;
    assert_eq!(summary.total(), 0);
    assert_eq!(summary.pairwise_counts["A:B"], 0);
    assert_eq!(harness.slice("A")[&NodeId::new("B")], BTreeSet::new());
    assert_eq!(harness.slice("B")[&NodeId::new("A")], BTreeSet::new());
}

#[tokio::test]
async fn unhealthy_node_engine_counts_as_empty() {
    let shared = person("Anna", "Meier", 1980);
    let mut harness = Harness::new(vec![
        ("A", LocalDataset::from_rows([shared.clone()])),
        ("B", LocalDataset::from_rows([shared.clone()])),
        ("C", LocalDataset::from_rows([shared])),
    ])
    .await;
    harness.engines[&NodeId::new("B")].set_healthy(false);
    let summary = harness.run().await;

    assert_eq!(summary.failed_nodes, [NodeId::new("B")].into_iter().collect());
    assert_eq!(summary.total(), 0);
    assert_eq!(summary.pairwise_counts["A:B"], 0);
    assert_eq!(summary.pairwise_counts["A:C"], 1);
    assert_eq!(harness.slice("B")[&NodeId::new("A")], BTreeSet::new());
    assert_eq!(harness.slice("A")[&NodeId::new("C")], indices(&[0]));
}

#[tokio::test]
async fn possible_duplicate_is_left_out_and_counted() {
    let mut near = person("Emma", "Fischer", 1960);
    near.insert("ort".into(), "Bonn".into());
    let a = LocalDataset::from_rows([
        person("Anna", "Meier", 1980),
        person("Ben", "Roth", 1975),
        person("Clara", "Weber", 1990),
        person("Emma", "Fischer", 1960),
        near,
    ]);
    let mut harness = Harness::new(vec![
        ("A", a),
        ("B", LocalDataset::from_rows([person("Clara", "Weber", 1990)])),
    ])
    .await;
    let summary = harness.run().await;

    let node = summary.node_stats[&NodeId::new("A")];
    assert_eq!(node.submitted, 5);
    assert_eq!(node.linked, 4);
    assert_eq!(node.unresolved_duplicates, 1);
    assert_eq!(summary.resolution_stats[&NodeId::new("A")].submitted, 4);
    assert_eq!(summary.unresolved_duplicates(), 1);
    assert_eq!(summary.pairwise_counts["A:B"], 1);
    assert_eq!(harness.slice("A")[&NodeId::new("B")], indices(&[2]));
}

#[tokio::test]
async fn submission_is_sorted_by_local_index_not_pseudonym() {
    let (_engine, client) = spawn_stub("salt").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Known to the engine before the node runs, so it holds the oldest pseudonym.
    let known = person("Greta", "Wagner", 1950);
    let token = client.session_token(&TokenRequest::add_patient(1)).await.unwrap();
    assert!(matches!(
        client.add_patient(&token, &known).await.unwrap(),
        SubmitOutcome::Linked(_)
    ));

    let mut near = person("Anna", "Meier", 1980);
    near.insert("ort".into(), "Bonn".into());
    let dataset = LocalDataset::from_rows([
        person("Anna", "Meier", 1980),
        near,
        person("Ben", "Roth", 1975),
        known,
    ]);
    let mut node = NodeAgent::new(NodeId::new("A"), dataset, client, InMemoryResultStore::new())
        .with_health_policy(fast_health());

    let settings = LinkageSettings::default();
    let payload = ConfigPayload {
        engine: EngineConfig::for_nodes(&settings, &EngineDeployment::default(), "salt".into()),
        result_fields: settings.result_fields(),
    };
    let report = node
        .handle(Some(CoordinatorMessage::Config(payload)))
        .await
        .unwrap();
    let (records, stats) = match report {
        NodeReport::Submission { records, stats } => (records, stats),
        other => panic!("unexpected {other:?}"),
    };

    let order: Vec<usize> = records.iter().map(|r| r.index).collect();
    assert_eq!(order, vec![0, 2, 3]);
    assert!(records.windows(2).all(|w| w[0].index < w[1].index));
    assert!(records.iter().all(|r| !r.fields.is_empty()));
    assert_eq!(stats.unresolved_duplicates, 1);
    assert_eq!(node.phase(), RoundPhase::SubmitAndMatch);
}

#[tokio::test]
async fn identical_local_records_report_the_later_index() {
    let shared = person("Anna", "Meier", 1980);
    let mut harness = Harness::new(vec![
        ("A", LocalDataset::from_rows([shared.clone(), shared.clone()])),
        ("B", LocalDataset::from_rows([shared])),
    ])
    .await;
    let summary = harness.run().await;
    assert_eq!(summary.node_stats[&NodeId::new("A")].linked, 2);
    assert_eq!(summary.resolution_stats[&NodeId::new("A")].submitted, 1);
    assert_eq!(harness.slice("A")[&NodeId::new("B")], indices(&[1]));
}

#[tokio::test]
async fn synthetic_cohort_links_exactly_the_shared_records() {
    let config = CohortConfig {
        seed: 7,
        shared: 4,
        unique_per_node: 6,
        ..CohortConfig::default()
    };
    let cohort = generate_cohort(&config);
    let datasets = vec![
        ("A", cohort.datasets[&NodeId::new("A")].clone()),
        ("B", cohort.datasets[&NodeId::new("B")].clone()),
        ("C", cohort.datasets[&NodeId::new("C")].clone()),
    ];
    let mut harness = Harness::new(datasets).await;
    let summary = harness.run().await;
    assert_eq!(summary.total(), cohort.shared);
    for pair in ["A:B", "A:C", "B:C"] {
        assert_eq!(summary.pairwise_counts[pair], cohort.shared, "{pair}");
    }
    for node in ["A", "B", "C"] {
        assert!(harness.slice(node).values().all(|s| s.len() == cohort.shared));
    }
}
