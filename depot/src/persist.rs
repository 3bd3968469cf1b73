//! On-disk snapshot store.
//!
//! Each node keeps its snapshots under `<data_dir>/snapshots/`. A file holds
//! one [`SnapshotRecord`]: the log position it covers, the voter set and
//! address table at that position, and the state machine bytes in the
//! snapshot wire format. The same record travels inside raft snapshot
//! messages, so a node that installs a leader's snapshot learns the member
//! addresses along with the data.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consensus::{Member, NodeId};

/// Newest snapshots kept on disk by default.
pub const DEFAULT_RETAIN: usize = 3;

const FILE_PREFIX: &str = "snapshot-";
const FILE_SUFFIX: &str = ".bin";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub index: u64,
    pub term: u64,
    pub voters: Vec<NodeId>,
    pub members: Vec<Member>,
    /// State machine contents in snapshot wire format.
    pub state: Vec<u8>,
}

impl SnapshotRecord {
    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    /// Opens (creating if needed) the snapshot directory under `data_dir`.
    pub fn open(data_dir: &Path, retain: usize) -> Result<Self, PersistError> {
        let dir = data_dir.join("snapshots");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `record` and prunes older snapshots beyond the retention count.
    ///
    /// The file is written under a temporary name and renamed into place, so
    /// a crash mid-write never leaves a truncated snapshot behind.
    pub fn save(&self, record: &SnapshotRecord) -> Result<PathBuf, PersistError> {
        let bytes = record.encode()?;
        let path = self.dir.join(file_name(record.index, record.term));
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        info!(path = %path.display(), index = record.index, term = record.term, "snapshot saved");
        self.prune()?;
        Ok(path)
    }

    /// Loads the newest readable snapshot, skipping files that fail to decode.
    pub fn latest(&self) -> Result<Option<SnapshotRecord>, PersistError> {
        for path in self.list()?.into_iter().rev() {
            let bytes = fs::read(&path)?;
            match SnapshotRecord::decode(&bytes) {
                Ok(record) => {
                    debug!(path = %path.display(), index = record.index, "loaded snapshot");
                    return Ok(Some(record));
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable snapshot")
                }
            }
        }
        Ok(None)
    }

    /// Snapshot files, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>, PersistError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX));
            if is_snapshot {
                paths.push(path);
            }
        }
        // Zero-padded names sort by index, then term.
        paths.sort();
        Ok(paths)
    }

    fn prune(&self) -> Result<(), PersistError> {
        let paths = self.list()?;
        let excess = paths.len().saturating_sub(self.retain);
        for path in paths.into_iter().take(excess) {
            debug!(path = %path.display(), "removing old snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn file_name(index: u64, term: u64) -> String {
    format!("{FILE_PREFIX}{index:020}-{term:020}{FILE_SUFFIX}")
}
