//! LMDB-backed store
//!
//! Single-file LMDB environments through the heed crate. Every database id
//! maps to one `cf_*.lmdb` file; the `NO_SUB_DIR` flag keeps the on-disk
//! layout to that file plus its `-lock` sibling.
//!
//! # Thread safety
//!
//! LMDB gives us transactions; the extra `cursor_lock` mutex serializes
//! destructive modification against cursor iteration. A cursor holds the
//! mutex for its whole lifetime, and plain writes/deletes acquire it too,
//! so a cursor never observes a delete it did not request itself.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use pledge_core::StoreError;

use crate::{DbId, Kv, KvCursor, OpenOutcome};

/// Map size for every environment; the stores the engine keeps are small.
const DEFAULT_MAP_SIZE: usize = 100 * 1024 * 1024;

/// One LMDB-backed store handle.
pub struct LmdbKv {
    env: Env,
    db: Database<Bytes, Bytes>,
    path: PathBuf,
    cursor_lock: Mutex<()>,
}

impl LmdbKv {
    /// Open the store for `id` under `state_dir`, creating the file when
    /// missing. Corruption reported by the storage layer yields
    /// `OpenOutcome::Broken` so the caller can schedule a repair.
    pub fn open(state_dir: &Path, id: DbId) -> Result<OpenOutcome<LmdbKv>, StoreError> {
        Self::open_file(&id.path(state_dir))
    }

    /// Open an arbitrary database file (the repair pipeline uses this for
    /// replacement files).
    pub fn open_file(path: &Path) -> Result<OpenOutcome<LmdbKv>, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(DEFAULT_MAP_SIZE)
                .max_dbs(1)
                .flags(EnvFlags::NO_SUB_DIR)
                .open(path)
        };
        let env = match env {
            Ok(env) => env,
            Err(e) if is_corruption(&e) => return Ok(OpenOutcome::Broken),
            Err(e) => {
                return Err(StoreError::OpenFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        let mut wtxn = env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = match env.create_database(&mut wtxn, None) {
            Ok(db) => db,
            Err(e) if is_corruption(&e) => return Ok(OpenOutcome::Broken),
            Err(e) => return Err(StoreError::Transaction(e.to_string())),
        };
        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(OpenOutcome::Open(LmdbKv {
            env,
            db,
            path: path.to_path_buf(),
            cursor_lock: Mutex::new(()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Collect every entry under one read transaction.
    pub fn snapshot(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let mut entries = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| StoreError::Transaction(e.to_string()))?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn write_unlocked(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.db
            .put(&mut wtxn, key, value)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    fn delete_unlocked(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let deleted = self
            .db
            .delete(&mut wtxn, key)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(deleted)
    }
}

/// Whether a heed error means the file itself is damaged rather than the
/// operation having transiently failed.
fn is_corruption(e: &heed::Error) -> bool {
    matches!(
        e,
        heed::Error::Mdb(
            heed::MdbError::Corrupted | heed::MdbError::Invalid | heed::MdbError::VersionMismatch
        )
    )
}

impl Kv for LmdbKv {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        match self.db.get(&rtxn, key) {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Transaction(e.to_string())),
        }
    }

    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let _guard = self
            .cursor_lock
            .lock()
            .map_err(|_| StoreError::Transaction("cursor lock poisoned".to_string()))?;
        self.write_unlocked(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        let _guard = self
            .cursor_lock
            .lock()
            .map_err(|_| StoreError::Transaction("cursor lock poisoned".to_string()))?;
        self.delete_unlocked(key)
    }

    fn cursor(&self) -> Result<Box<dyn KvCursor + '_>, StoreError> {
        let guard = self
            .cursor_lock
            .lock()
            .map_err(|_| StoreError::Transaction("cursor lock poisoned".to_string()))?;
        let entries = self.snapshot()?;
        Ok(Box::new(LmdbCursor {
            store: self,
            _guard: guard,
            entries,
            next_index: 0,
            current: None,
            pending_delete: None,
        }))
    }
}

/// Cursor over an LMDB store. Holds the store's cursor mutex for its
/// lifetime and iterates a stable snapshot taken at creation.
pub struct LmdbCursor<'a> {
    store: &'a LmdbKv,
    _guard: MutexGuard<'a, ()>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    next_index: usize,
    current: Option<Vec<u8>>,
    pending_delete: Option<Vec<u8>>,
}

impl LmdbCursor<'_> {
    fn apply_pending_delete(&mut self) -> Result<(), StoreError> {
        if let Some(key) = self.pending_delete.take() {
            self.store.delete_unlocked(&key)?;
        }
        Ok(())
    }
}

impl KvCursor for LmdbCursor<'_> {
    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.apply_pending_delete()?;
        match self.entries.get(self.next_index) {
            Some((key, value)) => {
                self.next_index += 1;
                self.current = Some(key.clone());
                Ok(Some((key.clone(), value.clone())))
            }
            None => {
                self.current = None;
                Ok(None)
            }
        }
    }

    fn delete_current(&mut self) {
        self.pending_delete = self.current.clone();
    }

    fn write_current(&mut self, value: &[u8]) -> Result<(), StoreError> {
        match &self.current {
            // Writes under the cursor are safe, no queueing needed.
            Some(key) => self.store.write_unlocked(key, value),
            None => Err(StoreError::Transaction(
                "cursor has no current entry".to_string(),
            )),
        }
    }
}

impl Drop for LmdbCursor<'_> {
    fn drop(&mut self) {
        let _ = self.apply_pending_delete();
    }
}
