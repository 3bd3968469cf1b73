//! Leader-forwarding gateway.
//!
//! Any node accepts client requests. Reads are served from the local
//! container and may be stale on a follower; that is the accepted trade-off
//! for not routing reads through consensus. Writes are proposed locally when
//! this node leads, and otherwise relayed over HTTP to the leader's API
//! address taken from the cluster address table.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::consensus::{CommitResult, ConsensusEngine, EngineStatus, Member, NodeId, Role};
use crate::error::{Error, Result};
use crate::membership::MembershipController;
use crate::store::KvStore;

/// Bound on how long a local write waits for its commit.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time a forwarding node waits past the leader's own commit bound,
/// so the leader's answer arrives before the relay gives up.
pub const FORWARD_GRACE: Duration = Duration::from_secs(2);

/// Header marking a request that one node already forwarded to another.
///
/// A forwarded request is never forwarded again, which stops two nodes with
/// disagreeing leader views from bouncing a write between them.
pub const FORWARDED_HEADER: &str = "x-depot-forwarded";

/// Where a write request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    /// Relayed by another node's gateway.
    Peer,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long one proposal waits to be applied. Leaders and followers are
    /// expected to share this value.
    pub commit_timeout: Duration,
    /// Added to the leader's worst case when relaying a write.
    pub forward_grace: Duration,
    /// When false, writes on a follower fail with `NotLeader` instead of
    /// being relayed.
    pub forward_writes: bool,
}

impl GatewayConfig {
    /// Time allowed for a relayed request that makes the leader commit
    /// `proposals` entries one after another.
    pub fn forward_timeout(&self, proposals: usize) -> Duration {
        let proposals = u32::try_from(proposals.max(1)).unwrap_or(u32::MAX);
        self.commit_timeout
            .checked_mul(proposals)
            .unwrap_or(Duration::MAX)
            .saturating_add(self.forward_grace)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            commit_timeout: COMMIT_TIMEOUT,
            forward_grace: FORWARD_GRACE,
            forward_writes: true,
        }
    }
}

enum Route {
    Local,
    Forward(SocketAddr),
}

/// Cheap to clone; every clone shares the same engine and HTTP client.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<KvStore>,
    engine: Arc<dyn ConsensusEngine>,
    membership: Arc<MembershipController>,
    client: reqwest::Client,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        store: Arc<KvStore>,
        engine: Arc<dyn ConsensusEngine>,
        config: GatewayConfig,
    ) -> Self {
        let membership = Arc::new(MembershipController::new(
            Arc::clone(&engine),
            config.commit_timeout,
        ));
        Self {
            inner: Arc::new(Inner {
                store,
                engine,
                membership,
                client: reqwest::Client::new(),
                config,
            }),
        }
    }

    /// Local read; `None` when the key is absent on this node.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.store.get(key)
    }

    /// This node's view of the cluster.
    pub fn status(&self) -> EngineStatus {
        self.inner.engine.status()
    }

    /// Writes every pair, in key order. The first failure stops the batch;
    /// pairs committed before it stay committed.
    pub async fn set(&self, entries: BTreeMap<String, String>, origin: Origin) -> Result<()> {
        match self.route(origin)? {
            Route::Local => {
                for (key, value) in entries {
                    self.commit(Command::set(key, value)).await?;
                }
                Ok(())
            }
            Route::Forward(leader) => {
                let body = serde_json::to_vec(&entries)
                    .map_err(|err| Error::InvalidRequest(err.to_string()))?;
                let proposals = entries.len();
                self.forward(leader, Method::PUT, &["setKV"], body, proposals)
                    .await
            }
        }
    }

    /// Deletes `key`. Deleting an absent key succeeds.
    pub async fn delete(&self, key: String, origin: Origin) -> Result<()> {
        match self.route(origin)? {
            Route::Local => self.commit(Command::delete(key)).await.map(|_| ()),
            Route::Forward(leader) => {
                let segments = ["deleteKV", key.as_str()];
                self.forward(leader, Method::DELETE, &segments, Vec::new(), 1)
                    .await
            }
        }
    }

    /// Adds `member` as a voter through the leader. A member parsed from a
    /// bare raft address has no API address, so writes cannot be forwarded
    /// to it should it become leader.
    pub async fn add_node(&self, member: Member, origin: Origin) -> Result<()> {
        match self.route(origin)? {
            Route::Local => {
                let membership = Arc::clone(&self.inner.membership);
                blocking(move || membership.add_node(member)).await.map(|_| ())
            }
            Route::Forward(leader) => {
                let body = member.to_string().into_bytes();
                self.forward(leader, Method::POST, &["addNode"], body, 1)
                    .await
            }
        }
    }

    /// Removes the voter listening on `raft_addr` through the leader.
    pub async fn remove_node(&self, raft_addr: SocketAddr, origin: Origin) -> Result<()> {
        match self.route(origin)? {
            Route::Local => {
                let membership = Arc::clone(&self.inner.membership);
                let id: NodeId = Member::new(raft_addr, None).id;
                blocking(move || membership.remove_node(id)).await.map(|_| ())
            }
            Route::Forward(leader) => {
                let body = raft_addr.to_string().into_bytes();
                self.forward(leader, Method::DELETE, &["removeNode"], body, 1)
                    .await
            }
        }
    }

    fn route(&self, origin: Origin) -> Result<Route> {
        let status = self.inner.engine.status();
        if status.role == Role::Leader {
            return Ok(Route::Local);
        }
        if !self.inner.config.forward_writes || origin == Origin::Peer {
            return Err(Error::NotLeader);
        }
        let Some(leader) = status.leader() else {
            debug!(role = ?status.role, "no known leader to forward to");
            return Err(Error::NotLeader);
        };
        if leader.id == status.id {
            return Err(Error::NotLeader);
        }
        match leader.api_addr {
            Some(api) => Ok(Route::Forward(api)),
            None => Err(Error::Forward(format!(
                "leader {raft} has no API address; re-add it as {raft}=<api address>",
                raft = leader.raft_addr
            ))),
        }
    }

    async fn commit(&self, command: Command) -> Result<CommitResult> {
        let data = command
            .encode()
            .map_err(|err| Error::InvalidRequest(err.to_string()))?;
        let engine = Arc::clone(&self.inner.engine);
        let timeout = self.inner.config.commit_timeout;
        let method = command.method();
        let result = blocking(move || engine.propose(data, timeout).map_err(Error::from)).await;
        match &result {
            Ok(commit) => debug!(
                method = method.as_str(),
                key = command.key(),
                index = commit.index,
                "write committed"
            ),
            Err(err) => warn!(
                method = method.as_str(),
                key = command.key(),
                error = %err,
                "write failed"
            ),
        }
        result
    }

    /// Relays a write to the leader and returns its answer. `proposals` is
    /// how many entries the leader commits for it.
    async fn forward(
        &self,
        leader: SocketAddr,
        method: Method,
        segments: &[&str],
        body: Vec<u8>,
        proposals: usize,
    ) -> Result<()> {
        let url = leader_url(leader, segments)?;
        info!(%url, %method, "forwarding write to leader");

        let response = self
            .inner
            .client
            .request(method, url)
            .header(FORWARDED_HEADER, "1")
            .timeout(self.inner.config.forward_timeout(proposals))
            .body(body)
            .send()
            .await
            .map_err(|err| Error::Forward(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .map_err(|err| Error::Forward(err.to_string()))?;
        Err(Error::Relayed {
            status: status.as_u16(),
            body,
        })
    }
}

/// Builds `http://<leader>/<segments..>` with each segment percent-encoded.
fn leader_url(leader: SocketAddr, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(&format!("http://{leader}/"))
        .map_err(|err| Error::Forward(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| Error::Forward(format!("cannot build URL for {leader}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Runs a blocking engine call off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|err| {
        warn!(error = %err, "blocking engine call did not complete");
        Error::Stopped
    })?
}
