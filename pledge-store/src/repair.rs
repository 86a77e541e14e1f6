//! Database repair
//!
//! Repair streams every readable record of a damaged file into a freshly
//! created replacement. The read happens in a forked child with the
//! default bus-error disposition restored, so a fault on a memory-mapped
//! page kills the child cleanly instead of the agent; the parent decides
//! between renaming the replacement over the original and removing the
//! original outright. Repair attempts on one file are serialized by an
//! exclusive lock on its timestamp file.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use pledge_core::StoreError;
use tracing::{error, info, warn};

use crate::{diagnose_files, Kv, LmdbKv, OpenOutcome};

/// Suffix of the replacement file written by the child.
pub const REPAIR_FILE_EXTENSION: &str = ".repair-new";
/// Suffix of the timestamp file recording when repair last ran.
pub const REPAIR_STAMP_EXTENSION: &str = ".repaired";
/// Suffix of the pre-repair backup copy.
pub const BACKUP_EXTENSION: &str = ".backup";

/// How a completed repair left the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The replacement was renamed over the original.
    Replaced,
    /// Salvage failed; the original was removed.
    Removed,
}

fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(extension);
    PathBuf::from(s)
}

/// Stream every record from `src` into a fresh database at `dst`.
/// Salvages what it can: an iteration error ends the copy but what was
/// already written stays.
pub fn replicate(src: &Path, dst: &Path) -> Result<usize, StoreError> {
    let _ = std::fs::remove_file(dst);

    let source = match LmdbKv::open_file(src)? {
        OpenOutcome::Open(db) => db,
        OpenOutcome::Broken => {
            return Err(StoreError::Corrupt {
                path: src.to_path_buf(),
            })
        }
    };
    let dest = match LmdbKv::open_file(dst)? {
        OpenOutcome::Open(db) => db,
        OpenOutcome::Broken => {
            return Err(StoreError::Corrupt {
                path: dst.to_path_buf(),
            })
        }
    };

    let mut copied = 0usize;
    let entries = source.snapshot()?;
    for (key, value) in entries {
        dest.write(&key, &value)?;
        copied += 1;
    }
    Ok(copied)
}

/// Write the raw host-endian epoch into the (already locked) timestamp
/// file.
fn record_repair_timestamp(stamp: &mut std::fs::File) -> bool {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    use std::io::Seek;
    if stamp.seek(std::io::SeekFrom::Start(0)).is_err() {
        return false;
    }
    stamp.write_all(&now.to_ne_bytes()).is_ok()
}

/// Repair one database file.
///
/// The child process restores the default `SIGBUS` disposition and runs
/// the replication; the parent waits. A clean child exit renames the
/// replacement over the original; any failure or signal death removes the
/// original instead. Either way a timestamp lands in `<file>.repaired`,
/// whose exclusive lock serializes concurrent repair attempts.
pub fn repair_file(path: &Path) -> Result<RepairOutcome, StoreError> {
    let dest = with_extension(path, REPAIR_FILE_EXTENSION);
    let stamp_path = with_extension(path, REPAIR_STAMP_EXTENSION);

    let mut stamp = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&stamp_path)?;

    // Exclusive advisory lock; waits for any concurrent repair to finish.
    let rc = unsafe { libc::flock(stamp.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(StoreError::RepairFailed {
            path: path.to_path_buf(),
            reason: format!("flock: {}", std::io::Error::last_os_error()),
        });
    }

    let outcome = run_repair_child(path, &dest, &mut stamp);

    unsafe { libc::flock(stamp.as_raw_fd(), libc::LOCK_UN) };
    outcome
}

fn run_repair_child(
    path: &Path,
    dest: &Path,
    stamp: &mut std::fs::File,
) -> Result<RepairOutcome, StoreError> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(StoreError::RepairFailed {
            path: path.to_path_buf(),
            reason: format!("fork: {}", std::io::Error::last_os_error()),
        });
    }

    if pid == 0 {
        // Child. Reading a corrupt memory-mapped file can raise SIGBUS;
        // the agent handles that specially but this process must just die
        // so the parent can tell.
        unsafe {
            libc::signal(libc::SIGBUS, libc::SIG_DFL);
        }
        let code = match replicate(path, dest) {
            Ok(_) => 0,
            Err(_) => 1,
        };
        unsafe { libc::_exit(code) };
    }

    // Parent.
    let mut status: libc::c_int = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    if waited != pid {
        return Err(StoreError::RepairFailed {
            path: path.to_path_buf(),
            reason: format!("waitpid: {}", std::io::Error::last_os_error()),
        });
    }

    let clean_exit = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
    if clean_exit {
        info!(path = %path.display(), "replacing database with the repaired copy");
        if let Err(e) = std::fs::rename(dest, path) {
            let _ = std::fs::remove_file(dest);
            return Err(StoreError::RepairFailed {
                path: path.to_path_buf(),
                reason: format!("rename: {e}"),
            });
        }
        // The replacement's own lock file has no business surviving the
        // rename.
        let _ = std::fs::remove_file(with_extension(dest, "-lock"));
        if !record_repair_timestamp(stamp) {
            warn!(path = %path.display(), "failed to record repair timestamp");
        }
        return Ok(RepairOutcome::Replaced);
    }

    if libc::WIFSIGNALED(status) {
        error!(
            path = %path.display(),
            signal = libc::WTERMSIG(status),
            "repair child died on a signal, removing the file"
        );
    } else {
        error!(path = %path.display(), "repair failed, removing the file");
    }
    let _ = std::fs::remove_file(dest);
    std::fs::remove_file(path).map_err(|e| StoreError::RepairFailed {
        path: path.to_path_buf(),
        reason: format!("unlink: {e}"),
    })?;
    // Stale lock siblings go with the file.
    let _ = std::fs::remove_file(with_extension(path, "-lock"));
    let _ = std::fs::remove_file(with_extension(path, ".lock"));
    if !record_repair_timestamp(stamp) {
        warn!(path = %path.display(), "failed to record repair timestamp");
    }
    Ok(RepairOutcome::Removed)
}

/// Diagnose a batch of files, back the corrupt ones up by copy, then
/// repair each. Returns the number of files whose repair failed.
pub fn repair_files(paths: &[PathBuf], force: bool) -> Result<usize, StoreError> {
    let corrupt = if force {
        paths.to_vec()
    } else {
        let corrupt = diagnose_files(paths)?;
        if corrupt.is_empty() {
            info!("no corrupted database files, nothing to do");
            return Ok(0);
        }
        info!(count = corrupt.len(), "corrupt databases to fix");
        corrupt
    };

    for path in &corrupt {
        let backup = with_extension(path, BACKUP_EXTENSION);
        if let Err(e) = std::fs::copy(path, &backup) {
            warn!(path = %path.display(), error = %e, "could not back up before repair");
        }
    }

    let mut failures = 0usize;
    for path in &corrupt {
        match repair_file(path) {
            Ok(outcome) => {
                info!(path = %path.display(), ?outcome, "repair finished");
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "repair failed");
                failures += 1;
            }
        }
    }

    if failures == 0 {
        info!("database repair successful");
    } else {
        error!(failures, "database repair failed");
    }
    Ok(failures)
}
