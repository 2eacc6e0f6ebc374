use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::file_lock;

/// Crash-safe monotonic counter backed by a primary file plus a staging
/// marker.
///
/// Every write stages the new value in `<name>.tmp`, renames it to
/// `<name>.new` (the commit point), rewrites and fsyncs the primary file,
/// then unlinks the marker. A surviving `<name>.new` on read means the
/// crash happened after commit: its value wins and the marker is removed.
pub struct Sequence {
    path: PathBuf,
    new_path: PathBuf,
    tmp_path: PathBuf,
    initial_value: u64,
}

impl Sequence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_initial_value(path, 1)
    }

    pub fn with_initial_value(path: impl Into<PathBuf>, initial_value: u64) -> Self {
        let path = path.into();
        let new_path = sibling(&path, ".new");
        let tmp_path = sibling(&path, ".tmp");
        Sequence {
            path,
            new_path,
            tmp_path,
            initial_value,
        }
    }

    /// Current value, or `None` before the first write
    pub fn current(&self) -> Result<Option<u64>> {
        self.with_file(false, |f| self.read_current(f))
    }

    pub fn set_current(&self, value: u64) -> Result<()> {
        self.with_file(true, |f| self.write_value(f, value))
    }

    /// Advance and return the new value
    pub fn next(&self) -> Result<u64> {
        self.with_file(true, |f| {
            let value = self.next_value(f)?;
            self.write_value(f, value)?;
            Ok(value)
        })
    }

    /// The value `next()` would return, without advancing
    pub fn peek_next(&self) -> Result<u64> {
        self.with_file(false, |f| self.next_value(f))
    }

    fn with_file<R>(&self, exclusive: bool, op: impl FnOnce(&mut File) -> Result<R>) -> Result<R> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file_lock::lock(&file, exclusive)?;
        let result = op(&mut file);
        file_lock::unlock(&file);
        result
    }

    fn read_current(&self, file: &mut File) -> Result<Option<u64>> {
        let raw = match fs::read_to_string(&self.new_path) {
            Ok(s) => {
                // Committed by the rename; the marker value wins
                log::debug!("recovering sequence value from {:?}", self.new_path);
                fs::remove_file(&self.new_path)?;
                s
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut s = String::new();
                file.read_to_string(&mut s)?;
                s
            }
            Err(e) => return Err(e.into()),
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u64>().map(Some).map_err(|e| {
            Error::new(
                ErrorKind::Parse,
                format!("bad sequence value in {:?}: {}", self.path, e),
            )
        })
    }

    fn next_value(&self, file: &mut File) -> Result<u64> {
        match self.read_current(file)? {
            Some(n) => Ok(n + 1),
            None => Ok(self.initial_value),
        }
    }

    fn write_value(&self, file: &mut File, value: u64) -> Result<()> {
        let text = value.to_string();
        fs::write(&self.tmp_path, &text)?;
        // Rename is the commit point
        fs::rename(&self.tmp_path, &self.new_path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(text.as_bytes())?;
        file.set_len(text.len() as u64)?;
        file.sync_all()?;
        fs::remove_file(&self.new_path)?;
        Ok(())
    }
}

fn sibling(path: &PathBuf, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
