use std::fs;
use std::path::PathBuf;

use crate::core::error::Result;
use crate::core::types::Uid;

/// Directory structure for the store's data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
    pub records_dir: PathBuf, // Authoritative message records (.bin files)
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join("records");
        fs::create_dir_all(&records_dir)?;
        Ok(StorageLayout {
            base_dir,
            records_dir,
        })
    }

    /// Live index directory owned by the backend
    pub fn index_path(&self) -> PathBuf {
        self.base_dir.join("index")
    }

    /// Shadow of the pre-rebuild index, present only mid-rebuild
    pub fn old_index_path(&self) -> PathBuf {
        self.base_dir.join("index.old")
    }

    pub fn record_path(&self, uid: Uid) -> PathBuf {
        self.records_dir.join(format!("{}.bin", uid))
    }

    pub fn flags_db_path(&self) -> PathBuf {
        self.base_dir.join("flags.db")
    }

    pub fn uid_seq_path(&self) -> PathBuf {
        self.base_dir.join("uid.seq")
    }

    pub fn uidvalidity_seq_path(&self) -> PathBuf {
        self.base_dir.join("uidvalidity.seq")
    }

    pub fn mailbox_id_seq_path(&self) -> PathBuf {
        self.base_dir.join("mailbox_id.seq")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("lock")
    }
}
