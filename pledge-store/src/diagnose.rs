//! Database diagnosis
//!
//! Read-only health check for store files: open, traverse everything, and
//! classify what went wrong. The repair pipeline runs this first so only
//! actually-damaged files get rewritten.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, EnvFlags, EnvOpenOptions};
use pledge_core::StoreError;
use tracing::debug;

/// Health classification of one database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// The file opens but pages inside it are damaged.
    CorruptPage,
    /// The file is shorter than a valid database or carries a bad header.
    Truncated,
    /// The file cannot be read at all.
    Unreadable,
}

impl Verdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Verdict::Ok)
    }
}

/// Diagnose one database file by opening it read-only and walking every
/// record.
pub fn diagnose(path: &Path) -> Verdict {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Verdict::Unreadable,
    };
    if metadata.len() == 0 {
        return Verdict::Truncated;
    }

    let env = unsafe {
        EnvOpenOptions::new()
            .max_dbs(1)
            .flags(EnvFlags::NO_SUB_DIR | EnvFlags::READ_ONLY)
            .open(path)
    };
    let env = match env {
        Ok(env) => env,
        Err(heed::Error::Mdb(heed::MdbError::Invalid | heed::MdbError::VersionMismatch)) => {
            return Verdict::Truncated
        }
        Err(heed::Error::Mdb(heed::MdbError::Corrupted)) => return Verdict::CorruptPage,
        Err(heed::Error::Io(_)) => return Verdict::Unreadable,
        Err(_) => return Verdict::CorruptPage,
    };

    let rtxn = match env.read_txn() {
        Ok(t) => t,
        Err(_) => return Verdict::CorruptPage,
    };
    let db: Database<Bytes, Bytes> = match env.open_database(&rtxn, None) {
        Ok(Some(db)) => db,
        // An empty environment with no database yet is healthy.
        Ok(None) => return Verdict::Ok,
        Err(_) => return Verdict::CorruptPage,
    };

    let iter = match db.iter(&rtxn) {
        Ok(iter) => iter,
        Err(_) => return Verdict::CorruptPage,
    };

    let mut records = 0usize;
    for result in iter {
        match result {
            Ok(_) => records += 1,
            Err(_) => return Verdict::CorruptPage,
        }
    }
    debug!(path = %path.display(), records, "database traversal complete");

    Verdict::Ok
}

/// Diagnose a batch, returning the paths that need repair.
pub fn diagnose_files(paths: &[std::path::PathBuf]) -> Result<Vec<std::path::PathBuf>, StoreError> {
    let mut corrupt = Vec::new();
    for path in paths {
        let verdict = diagnose(path);
        if !verdict.is_healthy() {
            tracing::warn!(path = %path.display(), ?verdict, "database needs repair");
            corrupt.push(path.clone());
        }
    }
    Ok(corrupt)
}
