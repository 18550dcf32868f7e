//! Persisted Raft log file
//!
//! One file per node, default `magnetite-log-<node_id>.db`. A fixed-size
//! little-endian header at offset 0 holds the durable consensus state
//! (`current_term`, `voted_for`, `commit_idx`) and is rewritten in place;
//! entry records follow as length-prefixed bincode and are only ever
//! appended.
//!
//! ```text
//! magic(4B) | version(2B) | reserved(2B) | term(8B) | vote(8B) | commit(8B)
//! [ len(4B) | bincode DiskEntry ]*
//! ```
//!
//! `append` and `sync_header` flush and fsync; failing either is fatal to
//! the node (the callers translate the error into a shutdown). Commit
//! index updates mutate only the in-memory header; they reach disk on the
//! next header sync.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cluster::engine::{Entry, EntryType, LogIndex, Term};
use crate::config::NodeId;
use crate::error::{MagnetiteError, Result};

const MAGIC: [u8; 4] = *b"MGRL";
const FORMAT_VERSION: u16 = 1;
const HEADER_SIZE: u64 = 32;

/// Durable consensus state stored in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate voted for in the current term, if any.
    pub voted_for: Option<NodeId>,
    /// Highest committed index at the last header sync.
    pub commit_idx: LogIndex,
}

impl Default for LogHeader {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            commit_idx: 0,
        }
    }
}

/// On-disk shape of one log entry record.
#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    term: u64,
    id: u32,
    etype: u8,
    data: Vec<u8>,
}

/// Append-only log file with an in-place header.
pub struct RaftLogFile {
    file: File,
    path: PathBuf,
    header: LogHeader,
    entry_count: u64,
}

impl RaftLogFile {
    /// Create a fresh log file, truncating any existing one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let mut log = Self {
            file,
            path,
            header: LogHeader::default(),
            entry_count: 0,
        };
        log.sync_header()?;
        debug!(path = %log.path.display(), "created raft log");
        Ok(log)
    }

    /// Open an existing log file and read its header. Entries are not
    /// read until [`load_entries`](Self::load_entries).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut raw = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)
            .map_err(|_| MagnetiteError::LogFile("file too short for header".into()))?;

        if raw[0..4] != MAGIC {
            return Err(MagnetiteError::LogFile("bad magic".into()));
        }
        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version != FORMAT_VERSION {
            return Err(MagnetiteError::LogFile(format!(
                "unsupported format version {version}"
            )));
        }
        let current_term = u64::from_le_bytes(raw[8..16].try_into().unwrap_or([0; 8]));
        let vote = i64::from_le_bytes(raw[16..24].try_into().unwrap_or([0; 8]));
        let commit_idx = u64::from_le_bytes(raw[24..32].try_into().unwrap_or([0; 8]));

        let header = LogHeader {
            current_term,
            voted_for: if vote < 0 { None } else { Some(vote as NodeId) },
            commit_idx,
        };
        debug!(
            path = %path.display(),
            term = header.current_term,
            commit_idx = header.commit_idx,
            "opened raft log"
        );
        Ok(Self {
            file,
            path,
            header,
            entry_count: 0,
        })
    }

    /// The in-memory header.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Number of entries appended or replayed through this handle.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // -- header updates ----------------------------------------------------

    /// Record the vote and flush the header durably.
    pub fn set_vote(&mut self, vote: Option<NodeId>) -> Result<()> {
        self.header.voted_for = vote;
        self.sync_header()
    }

    /// Record the term (and the accompanying vote) and flush durably.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeId>) -> Result<()> {
        self.header.current_term = term;
        self.header.voted_for = vote;
        self.sync_header()
    }

    /// Advance the in-memory commit index. Not flushed per call.
    pub fn set_commit(&mut self, idx: LogIndex) {
        if idx > self.header.commit_idx {
            self.header.commit_idx = idx;
        }
    }

    /// Rewrite the header block in place and fsync.
    pub fn sync_header(&mut self) -> Result<()> {
        let mut raw = [0u8; HEADER_SIZE as usize];
        raw[0..4].copy_from_slice(&MAGIC);
        raw[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        raw[8..16].copy_from_slice(&self.header.current_term.to_le_bytes());
        let vote: i64 = match self.header.voted_for {
            Some(id) => id as i64,
            None => -1,
        };
        raw[16..24].copy_from_slice(&vote.to_le_bytes());
        raw[24..32].copy_from_slice(&self.header.commit_idx.to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&raw)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    // -- entries -----------------------------------------------------------

    /// Append an entry record at the end of the file and fsync.
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        let record = DiskEntry {
            term: entry.term,
            id: entry.id,
            etype: entry.etype.as_u8(),
            data: entry.data.to_vec(),
        };
        let payload = bincode::serialize(&record)
            .map_err(|e| MagnetiteError::LogFile(e.to_string()))?;

        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.entry_count += 1;
        Ok(())
    }

    /// Replay all entry records in insertion order into `sink`.
    ///
    /// A torn final record (crash mid-append) stops replay with a warning
    /// rather than failing the node.
    pub fn load_entries(&mut self, mut sink: impl FnMut(Entry)) -> Result<usize> {
        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut loaded = 0usize;
        loop {
            let mut len_buf = [0u8; 4];
            match self.file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            match self.file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(
                        path = %self.path.display(),
                        record = loaded,
                        "torn record at log tail, stopping replay"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let record: DiskEntry = bincode::deserialize(&payload)
                .map_err(|e| MagnetiteError::LogFile(format!("record {loaded}: {e}")))?;
            let etype = EntryType::from_u8(record.etype).ok_or_else(|| {
                MagnetiteError::LogFile(format!(
                    "record {loaded}: unknown entry type {}",
                    record.etype
                ))
            })?;
            sink(Entry {
                term: record.term,
                id: record.id,
                etype,
                data: Bytes::from(record.data),
                user_data: None,
            });
            loaded += 1;
        }
        self.entry_count = loaded as u64;
        Ok(loaded)
    }
}

impl std::fmt::Debug for RaftLogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftLogFile")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("entries", &self.entry_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(term: Term, etype: EntryType, data: &[u8]) -> Entry {
        Entry {
            term,
            id: 7,
            etype,
            data: Bytes::copy_from_slice(data),
            user_data: None,
        }
    }

    // -- round trip --------------------------------------------------------

    #[test]
    fn append_then_replay_preserves_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");

        let mut log = RaftLogFile::create(&path).unwrap();
        log.append(&entry(1, EntryType::AddNode, b"cfg")).unwrap();
        log.append(&entry(1, EntryType::Normal, b"SET a 1")).unwrap();
        log.append(&entry(2, EntryType::Normal, b"bin\x00\x01")).unwrap();
        log.set_term(2, Some(1)).unwrap();
        log.set_commit(3);
        log.sync_header().unwrap();
        drop(log);

        let mut log = RaftLogFile::open(&path).unwrap();
        assert_eq!(
            *log.header(),
            LogHeader {
                current_term: 2,
                voted_for: Some(1),
                commit_idx: 3,
            }
        );
        let mut replayed = Vec::new();
        let n = log.load_entries(|e| replayed.push(e)).unwrap();
        assert_eq!(n, 3);
        assert_eq!(replayed[0].etype, EntryType::AddNode);
        assert_eq!(replayed[1].data.as_ref(), b"SET a 1");
        assert_eq!(replayed[2].term, 2);
        assert_eq!(replayed[2].data.as_ref(), b"bin\x00\x01");
        assert_eq!(log.entry_count(), 3);
    }

    #[test]
    fn fresh_log_has_zero_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        RaftLogFile::create(&path).unwrap();

        let mut log = RaftLogFile::open(&path).unwrap();
        assert_eq!(*log.header(), LogHeader::default());
        assert_eq!(log.load_entries(|_| {}).unwrap(), 0);
    }

    // -- header durability -------------------------------------------------

    #[test]
    fn header_survives_reopen_without_commit_sync() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");

        let mut log = RaftLogFile::create(&path).unwrap();
        log.set_term(4, None).unwrap();
        log.set_vote(Some(2)).unwrap();
        // Commit advance alone does not reach disk.
        log.set_commit(9);
        drop(log);

        let log = RaftLogFile::open(&path).unwrap();
        assert_eq!(log.header().current_term, 4);
        assert_eq!(log.header().voted_for, Some(2));
        assert_eq!(log.header().commit_idx, 0);
    }

    #[test]
    fn commit_index_is_monotonic_in_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        let mut log = RaftLogFile::create(&path).unwrap();
        log.set_commit(5);
        log.set_commit(3);
        assert_eq!(log.header().commit_idx, 5);
    }

    // -- corruption handling -----------------------------------------------

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        std::fs::write(&path, b"NOTALOGFILE_____________________").unwrap();
        assert!(RaftLogFile::open(&path).is_err());
    }

    #[test]
    fn open_rejects_truncated_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        std::fs::write(&path, b"MGRL").unwrap();
        assert!(RaftLogFile::open(&path).is_err());
    }

    #[test]
    fn torn_tail_record_stops_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");

        let mut log = RaftLogFile::create(&path).unwrap();
        log.append(&entry(1, EntryType::Normal, b"one")).unwrap();
        log.append(&entry(1, EntryType::Normal, b"two")).unwrap();
        drop(log);

        // Chop a few bytes off the last record to simulate a torn write.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();

        let mut log = RaftLogFile::open(&path).unwrap();
        let mut replayed = Vec::new();
        let n = log.load_entries(|e| replayed.push(e)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(replayed[0].data.as_ref(), b"one");
    }
}
