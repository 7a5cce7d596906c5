//! Synthetic cohorts for demos, tests and benches.
//!
//! Deterministic: same config (including seed) ⇒ same datasets. Every node
//! gets the `shared` records plus its own unique ones, shuffled, so the
//! expected intersection size is known up front. Any two generated records
//! differ in at least two fields, so none of them is a near-duplicate.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::dataset::LocalDataset;
use crate::types::{NodeId, RecordFields};

const FIRST_NAMES: &[&str] = &["Anna", "Ben", "Clara", "David", "Emma", "Felix", "Greta", "Hannes"];
const LAST_NAMES: &[&str] = &["Meier", "Schmidt", "Fischer", "Weber", "Wagner", "Becker", "Hoffmann"];
const TOWNS: &[(&str, u32)] = &[
    ("Mainz", 55116),
    ("Berlin", 10115),
    ("Hamburg", 20095),
    ("Leipzig", 4109),
    ("Bonn", 53111),
];

#[derive(Clone, Debug)]
pub struct CohortConfig {
    /// RNG seed. Same seed ⇒ same cohort.
    pub seed: u64,
    pub nodes: Vec<NodeId>,
    /// Records present at every node.
    pub shared: usize,
    /// Records present at one node only.
    pub unique_per_node: usize,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            nodes: vec![NodeId::new("A"), NodeId::new("B"), NodeId::new("C")],
            shared: 5,
            unique_per_node: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Cohort {
    pub datasets: BTreeMap<NodeId, LocalDataset>,
    /// Expected size of every pairwise and the global intersection.
    pub shared: usize,
}

/// Letters-only serial so generated names stay valid name strings.
fn serial_tag(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'a' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn person(rng: &mut StdRng, serial: usize) -> RecordFields {
    let tag = serial_tag(serial);
    let (town, plz) = TOWNS[rng.gen_range(0..TOWNS.len())];
    let last = format!("{}{}", LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())], tag);
    [
        ("vorname", format!("{}{}", FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())], tag)),
        ("nachname", last.clone()),
        ("geburtsname", last),
        ("geburtstag", rng.gen_range(1..=28).to_string()),
        ("geburtsmonat", rng.gen_range(1..=12).to_string()),
        ("geburtsjahr", rng.gen_range(1930..=2010).to_string()),
        ("ort", town.to_string()),
        ("plz", format!("{:05}", plz)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

pub fn generate(config: &CohortConfig) -> Cohort {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut serial = 0;
    let mut next_person = |rng: &mut StdRng| {
        serial += 1;
        person(rng, serial)
    };
    let shared: Vec<RecordFields> = (0..config.shared).map(|_| next_person(&mut rng)).collect();
    let mut datasets = BTreeMap::new();
    for node in &config.nodes {
        let mut rows = shared.clone();
        rows.extend((0..config.unique_per_node).map(|_| next_person(&mut rng)));
        rows.shuffle(&mut rng);
        datasets.insert(node.clone(), LocalDataset::from_rows(rows));
    }
    Cohort {
        datasets,
        shared: config.shared,
    }
}
