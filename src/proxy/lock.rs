//! Cross-process lock for the proxy config file
//!
//! The reconciliation loop and the operator commands run as separate
//! processes, so an in-process mutex cannot serialize their
//! read-modify-write cycles on the config file. Every writer additionally
//! takes an exclusive advisory lock on a sibling `<path>.lock` file for the
//! whole cycle. A sibling file is locked instead of the config itself so
//! the lock survives the config being rewritten or temporarily absent.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Exclusive hold on a config file's lock file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the lock for `path` is available. Acquisition runs on
    /// the blocking pool; the current task stays cooperative.
    pub async fn acquire(path: &Path) -> io::Result<FileLock> {
        let lock_path = lock_path(path);
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}
