//! Runs one node of the replicated key-value store.
//!
//! Start a three-node cluster on one machine:
//! ```bash
//! CLUSTER=127.0.0.1:30301=127.0.0.1:9001,127.0.0.1:30302=127.0.0.1:9002
//! CLUSTER=$CLUSTER,127.0.0.1:30303=127.0.0.1:9003
//! depot --raft-addr 127.0.0.1:30301 --api-addr 127.0.0.1:9001 --cluster $CLUSTER
//! depot --raft-addr 127.0.0.1:30302 --api-addr 127.0.0.1:9002 --cluster $CLUSTER
//! depot --raft-addr 127.0.0.1:30303 --api-addr 127.0.0.1:9003 --cluster $CLUSTER
//!
//! curl -X PUT localhost:9002/setKV -d '{"a":"1"}'
//! curl localhost:9003/getKV/a
//! ```
//!
//! A fourth node starts with `--join` and is added through any node:
//! `curl -X POST localhost:9001/addNode -d 127.0.0.1:30304=127.0.0.1:9004`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use depot::config::{Cli, NodeConfig};
use depot::consensus::ConsensusEngine;
use depot::fsm::Fsm;
use depot::gateway::Gateway;
use depot::http;
use depot::replication::{spawn_node, DataDir};
use depot::store::KvStore;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeConfig::from_cli(Cli::parse())?;
    let api_addr = config
        .local
        .api_addr
        .context("local member has no API address")?;
    info!(
        id = config.local.id,
        raft_addr = %config.local.raft_addr,
        %api_addr,
        data_dir = %config.data_dir.display(),
        join = config.join,
        "starting node"
    );

    let store = Arc::new(KvStore::new());
    let fsm = Box::new(Fsm::with_store(Arc::clone(&store)));
    let data = DataDir::open(&config.data_dir, config.snapshot_retain)?;
    let raft = spawn_node(config.node_options(), fsm, Some(data))?;

    let engine: Arc<dyn ConsensusEngine> = Arc::new(raft.clone());
    let gateway = Gateway::new(store, engine, config.gateway_config());
    let listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API address {api_addr}"))?;

    let result = http::serve(listener, gateway, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await;

    raft.shutdown();
    result
}
