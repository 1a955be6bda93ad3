//! Persisted node metadata.
//!
//! `current_term` and `voted_for` must survive restarts and be durable
//! before the node acts on them: a vote sent without the fsync completing
//! could be re-granted differently after a crash.

use crate::error::Result;
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// The persistent subset of node state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMeta {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate that received this node's vote in `current_term`.
    pub voted_for: Option<NodeId>,
}

/// File-backed metadata with explicit fsync.
pub(crate) struct MetaFile {
    file: File,
    cached: LogMeta,
    dirty: bool,
}

impl MetaFile {
    /// Open or create the metadata file, reading any existing contents.
    pub fn open(path: &Path) -> Result<Self> {
        let existing = match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => bincode::deserialize(&bytes)?,
            _ => LogMeta::default(),
        };
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self { file, cached: existing, dirty: false })
    }

    pub fn read(&self) -> LogMeta {
        self.cached
    }

    /// Overwrite the file contents. Not durable until [`MetaFile::sync`].
    pub fn write(&mut self, meta: LogMeta) -> Result<()> {
        let bytes = bincode::serialize(&meta)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(&bytes)?;
        self.cached = meta;
        self.dirty = true;
        Ok(())
    }

    /// Fsync the file. No-op when nothing changed since the last sync.
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_meta_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");

        {
            let mut meta = MetaFile::open(&path).unwrap();
            assert_eq!(meta.read(), LogMeta::default());
            meta.write(LogMeta { current_term: 5, voted_for: Some(3) }).unwrap();
            meta.sync().unwrap();
        }

        let meta = MetaFile::open(&path).unwrap();
        assert_eq!(meta.read(), LogMeta { current_term: 5, voted_for: Some(3) });
    }
}
