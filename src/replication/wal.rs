//! Write-ahead log for replication jobs.
//!
//! An entry is appended and flushed before strategy execution begins, so a
//! crash mid-replication can be resumed from the log on restart. Records are
//! keyed on the job id for idempotent replay; the resumption logic itself
//! belongs to the process that owns startup.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::{ReplicationError, Result};
use super::types::StrategyKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalEntry {
    pub job_id: String,
    pub file_id: String,
    pub source_node: String,
    pub target_nodes: Vec<String>,
    pub strategy: StrategyKind,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    Begin(WalEntry),
    Complete { job_id: String },
}

/// Append-only log of length-prefixed bincode records.
pub struct ReplicationWal {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReplicationWal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append a record and flush it to disk before returning.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let payload =
            bincode::serialize(record).map_err(|e| ReplicationError::Wal(e.to_string()))?;

        let mut file = self.file.lock();
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    pub fn append_begin(&self, entry: WalEntry) -> Result<()> {
        self.append(&WalRecord::Begin(entry))
    }

    pub fn mark_complete(&self, job_id: &str) -> Result<()> {
        self.append(&WalRecord::Complete {
            job_id: job_id.to_string(),
        })
    }

    /// Entries whose jobs began but never completed, in append order.
    /// Duplicate begins for one job id collapse to the latest record.
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        let records = self.read_all()?;

        let mut pending: HashMap<String, WalEntry> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for record in records {
            match record {
                WalRecord::Begin(entry) => {
                    if !pending.contains_key(&entry.job_id) {
                        order.push(entry.job_id.clone());
                    }
                    pending.insert(entry.job_id.clone(), entry);
                }
                WalRecord::Complete { job_id } => {
                    pending.remove(&job_id);
                    order.retain(|id| id != &job_id);
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect())
    }

    /// Rewrite the log keeping only still-pending begins.
    pub fn compact(&self) -> Result<()> {
        let pending = self.replay()?;

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in &pending {
                let payload = bincode::serialize(&WalRecord::Begin(entry.clone()))
                    .map_err(|e| ReplicationError::Wal(e.to_string()))?;
                tmp.write_all(&(payload.len() as u32).to_le_bytes())?;
                tmp.write_all(&payload)?;
            }
            tmp.flush()?;
            tmp.sync_data()?;
        }

        let mut file = self.file.lock();
        std::fs::rename(&tmp_path, &self.path)?;
        *file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<WalRecord>> {
        // Read from a fresh handle so the append cursor is untouched.
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= data.len() {
            let len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            offset += 4;

            if offset + len > data.len() {
                // Torn tail write from a crash; everything before it is valid.
                break;
            }

            match bincode::deserialize::<WalRecord>(&data[offset..offset + len]) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            offset += len;
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(job_id: &str, file_id: &str) -> WalEntry {
        WalEntry {
            job_id: job_id.to_string(),
            file_id: file_id.to_string(),
            source_node: "node-0".to_string(),
            target_nodes: vec!["node-1".to_string(), "node-2".to_string()],
            strategy: StrategyKind::Chunked,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal = ReplicationWal::open(dir.path().join("replication.wal")).unwrap();

        wal.append_begin(entry("job-1", "file-1")).unwrap();
        wal.append_begin(entry("job-2", "file-2")).unwrap();

        let pending = wal.replay().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].job_id, "job-1");
        assert_eq!(pending[1].job_id, "job-2");
    }

    #[test]
    fn test_complete_removes_from_replay() {
        let dir = TempDir::new().unwrap();
        let wal = ReplicationWal::open(dir.path().join("replication.wal")).unwrap();

        wal.append_begin(entry("job-1", "file-1")).unwrap();
        wal.append_begin(entry("job-2", "file-2")).unwrap();
        wal.mark_complete("job-1").unwrap();

        let pending = wal.replay().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, "job-2");
    }

    #[test]
    fn test_replay_is_idempotent_on_duplicate_begins() {
        let dir = TempDir::new().unwrap();
        let wal = ReplicationWal::open(dir.path().join("replication.wal")).unwrap();

        wal.append_begin(entry("job-1", "file-1")).unwrap();
        wal.append_begin(entry("job-1", "file-1")).unwrap();

        let pending = wal.replay().unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replication.wal");

        {
            let wal = ReplicationWal::open(&path).unwrap();
            wal.append_begin(entry("job-1", "file-1")).unwrap();
        }

        let wal = ReplicationWal::open(&path).unwrap();
        let pending = wal.replay().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].file_id, "file-1");
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replication.wal");

        let wal = ReplicationWal::open(&path).unwrap();
        wal.append_begin(entry("job-1", "file-1")).unwrap();

        // Simulate a crash mid-append: a length prefix with half a payload.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"torn").unwrap();
        }

        let pending = wal.replay().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, "job-1");
    }

    #[test]
    fn test_compact_drops_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replication.wal");
        let wal = ReplicationWal::open(&path).unwrap();

        for i in 0..10 {
            wal.append_begin(entry(&format!("job-{i}"), &format!("file-{i}")))
                .unwrap();
        }
        for i in 0..9 {
            wal.mark_complete(&format!("job-{i}")).unwrap();
        }

        let before = std::fs::metadata(&path).unwrap().len();
        wal.compact().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();

        assert!(after < before);
        let pending = wal.replay().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, "job-9");
    }
}
