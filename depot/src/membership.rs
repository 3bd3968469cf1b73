//! Cluster membership changes.
//!
//! Adding and removing voters both go through the leader, one change at a
//! time. Changes are proposed without index/term fencing, so two operators
//! racing to reconfigure the cluster get last-writer-wins; changes are
//! expected to be serialized by whoever drives them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::consensus::{CommitResult, ConsensusEngine, Member, NodeId, Role};
use crate::error::{Error, Result};

/// Proposes voter changes on the leader and waits for them to commit.
///
/// Every call fails with `NotLeader` on a follower; the gateway relays such
/// requests to the leader before they reach here.
pub struct MembershipController {
    engine: Arc<dyn ConsensusEngine>,
    timeout: Duration,
}

impl MembershipController {
    /// `timeout` bounds each change's wait for its commit.
    pub fn new(engine: Arc<dyn ConsensusEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Adds `member` as a voter. Blocks until the change commits.
    ///
    /// A member without an API address is accepted. It votes and replicates
    /// normally, but writes cannot be forwarded to it while it leads.
    pub fn add_node(&self, member: Member) -> Result<CommitResult> {
        self.ensure_leader()?;
        if member.api_addr.is_none() {
            warn!(
                member = %member,
                "adding voter without an API address; writes cannot be forwarded to it"
            );
        }
        info!(member = %member, id = member.id, "adding voter");
        self.engine
            .add_voter(member, self.timeout)
            .map_err(Error::from)
    }

    /// Removes the voter with `id`. Blocks until the change commits.
    pub fn remove_node(&self, id: NodeId) -> Result<CommitResult> {
        self.ensure_leader()?;

        let voters = self.engine.status().voters;
        if !voters.contains(&id) {
            return Err(Error::ConfigChange(format!("node {id} is not a voter")));
        }
        if voters.len() == 1 {
            return Err(Error::ConfigChange(
                "removing the last voter would leave the cluster without voters".to_string(),
            ));
        }

        info!(id, "removing voter");
        self.engine
            .remove_server(id, self.timeout)
            .map_err(Error::from)
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.engine.role() == Role::Leader {
            Ok(())
        } else {
            Err(Error::NotLeader)
        }
    }
}
