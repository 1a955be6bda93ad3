//! Snapshot files.
//!
//! A snapshot captures the user machine state at a log position together
//! with the cluster configuration in force there. Files are written to a
//! temporary name, fsynced, then renamed over the previous snapshot so a
//! crash leaves either the old or the new snapshot intact.

use crate::error::{CohortError, Result};
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Position and configuration a snapshot covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The snapshot replaces all entries up to and including this index.
    pub last_index: LogIndex,
    /// Term of `last_index`.
    pub last_term: Term,
    /// Cluster members in force at `last_index`.
    pub members: Vec<NodeId>,
}

/// A snapshot: metadata plus serialized machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub meta: SnapshotMeta,
    #[serde(with = "serde_bytes")]
    pub machine_state: Vec<u8>,
}

/// On-disk snapshot storage with crc32 integrity.
pub(crate) struct SnapshotFile {
    path: PathBuf,
    cached_meta: SnapshotMeta,
}

impl SnapshotFile {
    /// Open the snapshot location, reading metadata if a snapshot exists.
    pub fn open(path: &Path) -> Result<Self> {
        let cached_meta = match read_snapshot(path)? {
            Some(snapshot) => snapshot.meta,
            None => SnapshotMeta::default(),
        };
        Ok(Self { path: path.to_path_buf(), cached_meta })
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.cached_meta
    }

    pub fn index_term(&self) -> (LogIndex, Term) {
        (self.cached_meta.last_index, self.cached_meta.last_term)
    }

    pub fn read(&self) -> Result<Option<SnapshotData>> {
        read_snapshot(&self.path)
    }

    /// Persist a snapshot atomically.
    pub fn write(&mut self, snapshot: &SnapshotData) -> Result<()> {
        let payload = bincode::serialize(snapshot)?;
        let checksum = crc32fast::hash(&payload);

        let mut bytes = Vec::with_capacity(payload.len() + 4);
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes.extend_from_slice(&payload);

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_data()?;
        std::fs::rename(&tmp, &self.path)?;

        self.cached_meta = snapshot.meta.clone();
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<SnapshotData>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < 4 {
        return Err(CohortError::Snapshot("snapshot file too short".to_string()));
    }
    let expected = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let actual = crc32fast::hash(&bytes[4..]);
    if expected != actual {
        return Err(CohortError::ChecksumMismatch { expected, actual });
    }
    Ok(Some(bincode::deserialize(&bytes[4..])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot");

        let mut file = SnapshotFile::open(&path).unwrap();
        assert_eq!(file.index_term(), (0, 0));

        let snapshot = SnapshotData {
            meta: SnapshotMeta { last_index: 10, last_term: 3, members: vec![1, 2, 3] },
            machine_state: vec![1, 2, 3, 4],
        };
        file.write(&snapshot).unwrap();
        assert_eq!(file.index_term(), (10, 3));

        let reopened = SnapshotFile::open(&path).unwrap();
        assert_eq!(reopened.read().unwrap().unwrap(), snapshot);
    }

    #[test]
    fn test_corrupt_snapshot_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot");

        let mut file = SnapshotFile::open(&path).unwrap();
        file.write(&SnapshotData {
            meta: SnapshotMeta { last_index: 1, last_term: 1, members: vec![1] },
            machine_state: vec![7; 64],
        })
        .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(SnapshotFile::open(&path).is_err());
    }
}
