//! Command-line options and the node configuration derived from them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::consensus::{Member, MemberParseError};
use crate::gateway::GatewayConfig;
use crate::persist::DEFAULT_RETAIN;
use crate::replication::{NodeOptions, DEFAULT_SNAPSHOT_THRESHOLD, DEFAULT_TRAILING_LOGS};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Replicated key-value store node", long_about = None)]
pub struct Cli {
    /// Address peers use to reach this node's raft transport. Also the
    /// node's identity.
    #[arg(long, default_value = "127.0.0.1:30304")]
    pub raft_addr: SocketAddr,

    /// Address the HTTP API binds to.
    #[arg(long, default_value = "127.0.0.1:9004")]
    pub api_addr: SocketAddr,

    /// Comma separated cluster members, each `RAFT_ADDR` or
    /// `RAFT_ADDR=API_ADDR`. Defaults to a single-node cluster of this node.
    #[arg(long)]
    pub cluster: Option<String>,

    /// Start outside the configuration and wait for the leader to add this
    /// node through `/addNode`. `--cluster` then only seeds the address table.
    #[arg(long)]
    pub join: bool,

    /// Directory for snapshots. Defaults to a per-user location keyed by the
    /// node id.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Applied entries between snapshots.
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_THRESHOLD)]
    pub snapshot_threshold: u64,

    /// Snapshot files kept on disk.
    #[arg(long, default_value_t = DEFAULT_RETAIN)]
    pub snapshot_retain: usize,

    /// Seconds a write waits for its commit. Forwarded writes wait this long
    /// per entry plus a short grace, so every node should use the same value.
    #[arg(long, default_value_t = 10)]
    pub commit_timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Member(#[from] MemberParseError),
    #[error("{0} is not listed in --cluster; add it or pass --join")]
    NotInCluster(SocketAddr),
    #[error("no home directory found; pass --data-dir")]
    NoDataDir,
    #[error("--commit-timeout-secs must be at least 1")]
    ZeroTimeout,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub local: Member,
    /// Bootstrap address table, `local` included.
    pub cluster: Vec<Member>,
    pub join: bool,
    pub data_dir: PathBuf,
    pub snapshot_threshold: u64,
    pub snapshot_retain: usize,
    pub commit_timeout: Duration,
}

impl NodeConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.commit_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        let local = Member::new(cli.raft_addr, Some(cli.api_addr));

        let mut cluster = match &cli.cluster {
            Some(list) => parse_cluster(list)?,
            None => vec![local.clone()],
        };
        match cluster.iter_mut().find(|member| member.id == local.id) {
            // The local entry may omit the API address; --api-addr fills it.
            Some(entry) => entry.api_addr = entry.api_addr.or(local.api_addr),
            None if cli.join => cluster.push(local.clone()),
            None => return Err(ConfigError::NotInCluster(local.raft_addr)),
        }

        let data_dir = match cli.data_dir {
            Some(dir) => dir,
            None => default_data_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join(local.id.to_string()),
        };

        Ok(Self {
            local,
            cluster,
            join: cli.join,
            data_dir,
            snapshot_threshold: cli.snapshot_threshold.max(1),
            snapshot_retain: cli.snapshot_retain.max(1),
            commit_timeout: Duration::from_secs(cli.commit_timeout_secs),
        })
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            local: self.local.clone(),
            peers: self.cluster.clone(),
            join: self.join,
            snapshot_threshold: self.snapshot_threshold,
            trailing_logs: DEFAULT_TRAILING_LOGS,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            commit_timeout: self.commit_timeout,
            ..GatewayConfig::default()
        }
    }
}

/// Parses a comma separated member list, skipping empty items.
pub fn parse_cluster(list: &str) -> Result<Vec<Member>, MemberParseError> {
    let mut members: Vec<Member> = Vec::new();
    for spec in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let member: Member = spec.parse()?;
        if !members.iter().any(|known| known.id == member.id) {
            members.push(member);
        }
    }
    Ok(members)
}

/// Per-user data directory: `~/raft` on macOS, `~/AppData/raft` on Windows
/// and `~/.raft` elsewhere.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        if cfg!(target_os = "macos") {
            home.join("raft")
        } else if cfg!(windows) {
            home.join("AppData").join("raft")
        } else {
            home.join(".raft")
        }
    })
}
