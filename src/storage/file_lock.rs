use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::core::error::{Error, ErrorKind, Result};

/// Blocking flock on an open file
pub fn lock(file: &File, exclusive: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use libc::{LOCK_EX, LOCK_SH, flock};
        use std::os::unix::io::AsRawFd;

        let operation = if exclusive { LOCK_EX } else { LOCK_SH };
        let rc = unsafe { flock(file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(Error::new(
                ErrorKind::Io,
                format!("failed to acquire file lock: {}", std::io::Error::last_os_error()),
            ));
        }
    }
    Ok(())
}

pub fn unlock(file: &File) {
    #[cfg(unix)]
    {
        use libc::{LOCK_UN, flock};
        use std::os::unix::io::AsRawFd;

        unsafe {
            flock(file.as_raw_fd(), LOCK_UN);
        }
    }
}

/// Scoped cross-process lock, released on drop
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn acquire(path: &Path, exclusive: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock(&file, exclusive)?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        {
            let _guard = FileLock::acquire(&path, true).unwrap();
        }
        // Released on drop, so a second exclusive acquisition succeeds
        let _guard = FileLock::acquire(&path, true).unwrap();
    }
}
