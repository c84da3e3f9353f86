//! Locked appends and in-place rewrites of log files.
//!
//! Every mutation takes an exclusive advisory lock on the log file and is
//! attempted up to [`RetryPolicy::attempts`] times with a fixed delay.
//! Rewrites go through the locked handle so the file keeps its inode: a
//! writer blocked on the lock (in this process or another) appends to the
//! same file once it gets in. Reads take a shared lock and never see a
//! half-written rewrite.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use tracing::{debug, warn};

use super::LogError;

/// Bounded retry for log mutations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Identity of a file's contents as seen by the index caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    modified: SystemTime,
    len: u64,
}

/// Current stamp of `path`, or `None` if it does not exist.
pub fn stamp(path: &Path) -> io::Result<Option<FileStamp>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta.modified()?,
            len: meta.len(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read all lines of `path` under a shared lock. A missing file reads as
/// empty.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    FileExt::lock_shared(&file)?;
    let mut content = String::new();
    let read = file.read_to_string(&mut content);
    let _ = FileExt::unlock(&file);
    read?;
    Ok(content.lines().map(str::to_string).collect())
}

fn with_retry<T>(
    path: &Path,
    policy: RetryPolicy,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T, LogError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                return Err(LogError::Io {
                    path: path.to_path_buf(),
                    attempts,
                    source: e,
                });
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "Log write failed, retrying"
                );
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
        }
    }
}

struct LockedFile {
    file: File,
}

impl LockedFile {
    fn open(path: &Path, options: &OpenOptions) -> io::Result<Self> {
        let file = options.open(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Append one line under an exclusive lock and flush it to disk.
pub fn append_line(path: &Path, line: &str, policy: RetryPolicy) -> Result<(), LogError> {
    with_retry(path, policy, || {
        let mut locked = LockedFile::open(path, OpenOptions::new().create(true).append(true))?;
        locked.file.write_all(format!("{line}\n").as_bytes())?;
        locked.file.flush()?;
        locked.file.sync_data()
    })?;
    debug!(path = %path.display(), "Appended log line");
    Ok(())
}

/// Drop every line for which `remove` returns true, rewriting the file in
/// place while holding its lock. Returns the number of removed lines; the
/// file is untouched when nothing matches or it does not exist.
pub fn remove_lines(
    path: &Path,
    policy: RetryPolicy,
    remove: impl Fn(&str) -> bool,
) -> Result<usize, LogError> {
    with_retry(path, policy, || {
        let mut locked = match LockedFile::open(path, OpenOptions::new().read(true).write(true)) {
            Ok(locked) => locked,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut content = String::new();
        locked.file.read_to_string(&mut content)?;

        let mut removed = 0;
        let mut kept = String::with_capacity(content.len());
        for line in content.lines() {
            if remove(line) {
                removed += 1;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        if removed > 0 {
            locked.file.seek(SeekFrom::Start(0))?;
            locked.file.set_len(0)?;
            locked.file.write_all(kept.as_bytes())?;
            locked.file.sync_data()?;
        }
        Ok(removed)
    })
}
