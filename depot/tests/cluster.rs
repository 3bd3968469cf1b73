//! End-to-end tests: real raft nodes on localhost with their HTTP APIs.

mod common;

use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use reqwest::StatusCode;

use common::{bind_api, member, url};
use depot::consensus::{ConsensusEngine, Member, Role};
use depot::fsm::Fsm;
use depot::gateway::{Gateway, GatewayConfig};
use depot::http;
use depot::replication::{spawn_node, NodeOptions, RaftHandle};
use depot::store::KvStore;

const WAIT: Duration = Duration::from_secs(10);

struct TestNode {
    member: Member,
    api: SocketAddr,
    raft: RaftHandle,
    store: Arc<KvStore>,
}

/// Starts one node: raft worker plus HTTP API on an already bound listener.
fn start(
    options: NodeOptions,
    listener: tokio::net::TcpListener,
    api: SocketAddr,
) -> Result<TestNode> {
    let member = options.local.clone();
    let store = Arc::new(KvStore::new());
    let fsm = Box::new(Fsm::with_store(Arc::clone(&store)));
    let raft = spawn_node(options, fsm, None)?;
    let engine = Arc::new(raft.clone());
    let gateway = Gateway::new(Arc::clone(&store), engine, GatewayConfig::default());
    tokio::spawn(http::serve(listener, gateway, pending()));
    Ok(TestNode {
        member,
        api,
        raft,
        store,
    })
}

struct TestCluster {
    nodes: Vec<TestNode>,
    client: reqwest::Client,
}

impl TestCluster {
    async fn spawn(raft_ports: &[u16]) -> Result<Self> {
        let mut listeners = Vec::new();
        let mut members = Vec::new();
        for &port in raft_ports {
            let (listener, api) = bind_api().await;
            members.push(member(port, Some(api)));
            listeners.push((listener, api));
        }

        let mut nodes = Vec::new();
        for ((listener, api), local) in listeners.into_iter().zip(&members) {
            let options = NodeOptions::new(local.clone(), members.clone());
            nodes.push(start(options, listener, api)?);
        }
        Ok(Self {
            nodes,
            client: reqwest::Client::new(),
        })
    }

    /// Waits until one node leads and every node follows it.
    async fn wait_for_leader(&self) -> Result<usize> {
        let start = Instant::now();
        loop {
            if start.elapsed() > WAIT {
                bail!("no stable leader within {WAIT:?}");
            }
            let statuses: Vec<_> = self.nodes.iter().map(|n| n.raft.status()).collect();
            if let Some(leader) = statuses.iter().position(|s| s.role == Role::Leader) {
                let leader_id = self.nodes[leader].member.id;
                if statuses.iter().all(|s| s.leader_id == Some(leader_id)) {
                    return Ok(leader);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn wait_for_value(&self, node: &TestNode, key: &str, expected: &str) -> Result<()> {
        let start = Instant::now();
        loop {
            if node.store.get(key).as_deref() == Some(expected) {
                return Ok(());
            }
            if start.elapsed() > WAIT {
                bail!("node {} never saw {key}={expected}", node.member);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn shutdown(self) {
        for node in self.nodes {
            node.raft.shutdown();
        }
    }
}

#[tokio::test]
async fn write_on_follower_is_forwarded_and_replicated() -> Result<()> {
    let cluster = TestCluster::spawn(&[31701, 31702, 31703]).await?;
    let leader = cluster.wait_for_leader().await?;
    let follower = (leader + 1) % cluster.nodes.len();

    let response = cluster
        .client
        .put(url(cluster.nodes[follower].api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    for node in &cluster.nodes {
        cluster.wait_for_value(node, "a", "1").await?;
        let body = cluster
            .client
            .get(url(node.api, "/getKV/a"))
            .send()
            .await?
            .text()
            .await?;
        assert_eq!(body, "1");
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn delete_of_absent_key_on_leader_returns_204() -> Result<()> {
    let cluster = TestCluster::spawn(&[31711, 31712, 31713]).await?;
    let leader = cluster.wait_for_leader().await?;

    let response = cluster
        .client
        .delete(url(cluster.nodes[leader].api, "/deleteKV/ghost"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(cluster.nodes[leader].raft.status().applied_index > 0);

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn joined_node_catches_up_after_add_node() -> Result<()> {
    let mut cluster = TestCluster::spawn(&[31721, 31722, 31723]).await?;
    let leader = cluster.wait_for_leader().await?;
    cluster
        .client
        .put(url(cluster.nodes[leader].api, "/setKV"))
        .body(r#"{"before":"join"}"#)
        .send()
        .await?;

    let (listener, api) = bind_api().await;
    let joiner = member(31724, Some(api));
    let seeds: Vec<Member> = cluster.nodes.iter().map(|n| n.member.clone()).collect();
    let mut options = NodeOptions::new(joiner.clone(), seeds);
    options.join = true;
    cluster.nodes.push(start(options, listener, api)?);

    let follower = (leader + 1) % 3;
    let response = cluster
        .client
        .post(url(cluster.nodes[follower].api, "/addNode"))
        .body(joiner.to_string())
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let joined = &cluster.nodes[3];
    cluster.wait_for_value(joined, "before", "join").await?;
    assert!(cluster.nodes[leader].raft.status().voters.contains(&joiner.id));

    cluster.shutdown();
    Ok(())
}
