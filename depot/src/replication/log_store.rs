//! Durable raft log.
//!
//! One append-only file, `<data_dir>/raft/log.bin`, holds everything raft
//! must not forget across a restart: the entries, the hard state (term, vote,
//! commit) and the conf state. Each record is a 4-byte little-endian length
//! followed by a bincode [`LogRecord`]; entries inside a record keep raft's
//! own protobuf encoding.
//!
//! Replaying the file in order rebuilds the persisted state. A record cut
//! short by a crash mid-append is dropped and the file truncated before it.
//! After a snapshot the file is rewritten whole under a temporary name, so
//! it never grows past the entries still in the log.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const LOG_DIR: &str = "raft";
const LOG_FILE: &str = "log.bin";

/// Larger records are treated as corruption.
const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("raft log I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("raft log record codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("raft log entry decode error: {0}")]
    Entry(#[from] prost::DecodeError),
    #[error("raft log record of {0} bytes exceeds limit")]
    Oversized(usize),
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    /// Protobuf-encoded entries. Whatever was stored from the first entry's
    /// index onwards is replaced.
    Entries(Vec<Vec<u8>>),
    HardState { term: u64, vote: u64, commit: u64 },
    ConfState { voters: Vec<u64>, learners: Vec<u64> },
}

impl LogRecord {
    fn entries(entries: &[Entry]) -> Self {
        LogRecord::Entries(entries.iter().map(|entry| entry.encode_to_vec()).collect())
    }

    fn hard_state(hs: &HardState) -> Self {
        LogRecord::HardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        }
    }

    fn conf_state(cs: &ConfState) -> Self {
        LogRecord::ConfState {
            voters: cs.voters.clone(),
            learners: cs.learners.clone(),
        }
    }
}

/// State recovered by replaying the log file.
#[derive(Debug, Default)]
pub struct PersistedLog {
    pub hard_state: Option<HardState>,
    pub conf_state: Option<ConfState>,
    pub entries: BTreeMap<u64, Entry>,
}

impl PersistedLog {
    fn replay(&mut self, record: LogRecord) -> Result<(), LogError> {
        match record {
            LogRecord::Entries(encoded) => {
                let mut entries = Vec::with_capacity(encoded.len());
                for bytes in encoded {
                    entries.push(Entry::decode(&bytes[..])?);
                }
                if let Some(first) = entries.first() {
                    // A follower overwriting a conflicting suffix.
                    self.entries.split_off(&first.index);
                }
                self.entries
                    .extend(entries.into_iter().map(|entry| (entry.index, entry)));
            }
            LogRecord::HardState { term, vote, commit } => {
                let mut hs = HardState::default();
                hs.term = term;
                hs.vote = vote;
                hs.commit = commit;
                self.hard_state = Some(hs);
            }
            LogRecord::ConfState { voters, learners } => {
                self.conf_state = Some(ConfState::from((voters, learners)));
            }
        }
        Ok(())
    }

    /// The entries directly following `index`, up to the first gap.
    pub fn entries_after(&self, index: u64) -> Vec<Entry> {
        let mut next = index + 1;
        let mut run = Vec::new();
        for (&at, entry) in self.entries.range(next..) {
            if at != next {
                warn!(expected = next, found = at, "gap in persisted raft log");
                break;
            }
            run.push(entry.clone());
            next += 1;
        }
        run
    }
}

pub struct LogStore {
    path: PathBuf,
    file: File,
}

impl LogStore {
    /// Opens (creating if needed) the log under `data_dir` and replays it.
    pub fn open(data_dir: &Path) -> Result<(Self, PersistedLog), LogError> {
        let dir = data_dir.join(LOG_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);

        let mut persisted = PersistedLog::default();
        let mut valid_len = 0u64;
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            while let Some(payload) = read_record(&mut reader)? {
                persisted.replay(bincode::deserialize(&payload)?)?;
                valid_len += (4 + payload.len()) as u64;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                path = %path.display(),
                dropped = on_disk - valid_len,
                "truncating torn raft log tail"
            );
            file.set_len(valid_len)?;
        }
        info!(
            path = %path.display(),
            entries = persisted.entries.len(),
            "raft log opened"
        );
        Ok((Self { path, file }, persisted))
    }

    pub fn append(&mut self, entries: &[Entry]) -> Result<(), LogError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write(&LogRecord::entries(entries))
    }

    pub fn save_hard_state(&mut self, hs: &HardState) -> Result<(), LogError> {
        self.write(&LogRecord::hard_state(hs))
    }

    pub fn save_conf_state(&mut self, cs: &ConfState) -> Result<(), LogError> {
        self.write(&LogRecord::conf_state(cs))
    }

    /// Replaces the file with one holding exactly this state.
    pub fn rewrite(
        &mut self,
        hs: &HardState,
        cs: &ConfState,
        entries: &[Entry],
    ) -> Result<(), LogError> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            write_record(&mut file, &LogRecord::conf_state(cs))?;
            write_record(&mut file, &LogRecord::hard_state(hs))?;
            if !entries.is_empty() {
                write_record(&mut file, &LogRecord::entries(entries))?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        debug!(path = %self.path.display(), entries = entries.len(), "raft log rewritten");
        Ok(())
    }

    fn write(&mut self, record: &LogRecord) -> Result<(), LogError> {
        write_record(&mut self.file, record)?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn write_record<W: Write>(sink: &mut W, record: &LogRecord) -> Result<(), LogError> {
    let payload = bincode::serialize(record)?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(LogError::Oversized(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    sink.write_all(&frame)?;
    Ok(())
}

/// Next record payload, or `None` at the end of the file or a torn tail.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, LogError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Err(LogError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => Ok(Some(payload)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}
