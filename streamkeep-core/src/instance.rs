//! Single-writer guard for a download directory.
//!
//! The daemon holds an exclusive advisory lock on `.streamkeep.lock` in the
//! download root for its whole lifetime. Offline commands that delete files
//! or rewrite the registry take the same lock, so they fail fast instead of
//! racing a running daemon's merge jobs or having their edits overwritten
//! by its shutdown save.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{CaptureError, Result};

pub const INSTANCE_LOCK_FILE_NAME: &str = ".streamkeep.lock";

/// An acquired instance lock. Released automatically on drop.
#[derive(Debug)]
pub struct InstanceLock {
    _lock_file: File,
    lock_path: PathBuf,
}

impl InstanceLock {
    /// Attempt to take the lock for `root` without waiting.
    ///
    /// Returns [`CaptureError::AlreadyRunning`] if another handle holds it.
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|err| CaptureError::filesystem(root, err))?;
        let lock_path = root.join(INSTANCE_LOCK_FILE_NAME);

        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| CaptureError::filesystem(&lock_path, err))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                write_pid(&mut lock_file).map_err(|err| CaptureError::filesystem(&lock_path, err))?;
                debug!(lock = %lock_path.display(), "acquired instance lock");
                Ok(Self {
                    _lock_file: lock_file,
                    lock_path,
                })
            }
            Err(err) if is_contended(&err) => Err(CaptureError::AlreadyRunning {
                pid: read_pid(&mut lock_file),
                lock: lock_path,
            }),
            Err(err) => Err(CaptureError::filesystem(&lock_path, err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}
