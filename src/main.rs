//! Runs one linkage round-trip locally: a coordinator plus one agent per node.
//!
//! `NODE_DATASETS=A=a.csv,B=b.json` names the node datasets; without it a
//! synthetic three-node cohort is generated. `NODE_ENGINE_URLS=A=http://…` and
//! `COORDINATOR_ENGINE_URL` (falling back to `ENGINE_URL`) point parties at real
//! engines; any party without a URL gets an in-process stub engine. With
//! `ENGINE_BINARY` set, only the party whose URL equals `ENGINE_URL` starts and
//! stops its engine; one process manages at most one engine. Results land under
//! `RESULT_DIR/<node>/`.
//! The summary is printed as JSON.

use federated_linkage::config::generate_salt;
use federated_linkage::{
    generate_cohort, CohortConfig, Coordinator, EngineDeployment, EngineProvision, Federation,
    FileResultStore, LinkageSummary, LocalDataset, MatchingEngineClient, NodeAgent, NodeId,
    RuntimeSettings, StubEngine,
};
use log::{error, info};
use std::collections::BTreeMap;

/// `A=x,B=y` → `{A: x, B: y}`. Entries without `=` are skipped.
fn assignments(var: &str) -> BTreeMap<NodeId, String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .filter_map(|part| {
            let (node, value) = part.split_once('=')?;
            let (node, value) = (node.trim(), value.trim());
            if node.is_empty() || value.is_empty() {
                return None;
            }
            Some((NodeId::new(node), value.to_string()))
        })
        .collect()
}

/// Engine URL for one party, spawning a stub when none is configured.
async fn engine_for(
    configured: Option<String>,
    runtime: &RuntimeSettings,
    stub_salt: &str,
    claimed: &mut bool,
) -> std::io::Result<(MatchingEngineClient, EngineProvision)> {
    match configured {
        Some(url) => {
            let provision = runtime.provision_for(&url, claimed);
            Ok((MatchingEngineClient::new(url, runtime.api_key.clone()), provision))
        }
        None => {
            let stub = StubEngine::new(runtime.api_key.clone()).with_salt(stub_salt);
            let (addr, _handle) = stub.spawn("127.0.0.1:0").await?;
            Ok((
                MatchingEngineClient::new(format!("http://{}", addr), runtime.api_key.clone()),
                EngineProvision::External,
            ))
        }
    }
}

async fn run() -> Result<LinkageSummary, Box<dyn std::error::Error>> {
    let runtime = RuntimeSettings::from_env();
    let settings = runtime.linkage_settings()?;

    let paths = assignments("NODE_DATASETS");
    let datasets: BTreeMap<NodeId, LocalDataset> = if paths.is_empty() {
        info!("NODE_DATASETS unset; generating a synthetic cohort");
        generate_cohort(&CohortConfig::default()).datasets
    } else {
        let mut datasets = BTreeMap::new();
        for (node, path) in paths {
            datasets.insert(node, LocalDataset::load(&path)?);
        }
        datasets
    };

    let deployment = EngineDeployment {
        api_key: runtime.api_key.clone(),
        ..EngineDeployment::default()
    };
    let mut claimed = false;
    let coordinator_url = std::env::var("COORDINATOR_ENGINE_URL")
        .ok()
        .or_else(|| runtime.engine_url.clone());
    let (client, provision) = engine_for(coordinator_url, &runtime, "", &mut claimed).await?;
    let coordinator = Coordinator::new(&settings, &deployment, client)
        .with_provision(provision)
        .with_health_policy(runtime.health);

    // Node stubs blind with the salt the coordinator hands every node.
    let stub_salt = coordinator
        .node_payload()
        .engine
        .salt
        .clone()
        .unwrap_or_else(generate_salt);
    let mut urls = assignments("NODE_ENGINE_URLS");
    let mut nodes = Vec::new();
    for (id, dataset) in datasets {
        let (client, provision) = engine_for(urls.remove(&id), &runtime, &stub_salt, &mut claimed).await?;
        info!("node={} records={} engine={}", id, dataset.len(), client.base_url());
        let store = FileResultStore::new(runtime.result_dir.join(id.as_str()));
        nodes.push(
            NodeAgent::new(id, dataset, client, store)
                .with_provision(provision)
                .with_health_policy(runtime.health),
        );
    }

    Ok(Federation::new(coordinator, nodes).run().await?)
}

#[tokio::main]
async fn main() {
    let _ = env_logger::try_init();
    match run().await {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("could not encode summary: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("linkage run failed: {}", e);
            std::process::exit(1);
        }
    }
}
