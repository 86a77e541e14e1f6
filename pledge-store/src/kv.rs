//! Store abstraction
//!
//! A process opens databases by id, never by path; every id maps to one
//! file under the state directory. The trait carries exactly the
//! operations the engine needs, so the repair pipeline and the last-seen
//! index are written once against it.

use std::path::{Path, PathBuf};

use pledge_core::StoreError;

/// Identity of a persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbId {
    Lastseen,
    Locks,
    ClassesPersistent,
    ChecksumHashes,
    State,
}

impl DbId {
    /// Canonical file name under the state directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            DbId::Lastseen => "cf_lastseen.lmdb",
            DbId::Locks => "cf_lock.lmdb",
            DbId::ClassesPersistent => "cf_classes.lmdb",
            DbId::ChecksumHashes => "cf_checksum.lmdb",
            DbId::State => "cf_state.lmdb",
        }
    }

    pub fn path(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(self.file_name())
    }

    pub fn all() -> &'static [DbId] {
        &[
            DbId::Lastseen,
            DbId::Locks,
            DbId::ClassesPersistent,
            DbId::ChecksumHashes,
            DbId::State,
        ]
    }
}

/// Result of opening a store: either a usable handle, or the signal that
/// the file is corrupt and a repair should be scheduled. Transient OS
/// errors surface as `Err` instead.
pub enum OpenOutcome<T> {
    Open(T),
    Broken,
}

/// A key/value store handle. Write is insert-or-replace; deleting a
/// missing key is not an error.
pub trait Kv: Send + Sync {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    fn delete(&self, key: &[u8]) -> Result<bool, StoreError>;

    fn has_key(&self, key: &[u8]) -> bool {
        matches!(self.read(key), Ok(Some(_)))
    }

    fn value_size(&self, key: &[u8]) -> Option<usize> {
        match self.read(key) {
            Ok(Some(v)) => Some(v.len()),
            _ => None,
        }
    }

    /// Open a cursor. The cursor excludes concurrent destructive
    /// modification for its whole lifetime; see [`KvCursor`].
    fn cursor(&self) -> Result<Box<dyn KvCursor + '_>, StoreError>;
}

/// Iteration handle over a store.
///
/// Deletes requested through the cursor are queued and applied on the next
/// `advance` or on drop: the underlying store may invalidate iteration when
/// a key is removed under it, so the queueing is mandatory, not an
/// optimization. Writes to the current key are safe and applied directly.
pub trait KvCursor {
    /// Yield the next `(key, value)` pair, applying any queued delete
    /// first.
    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Queue deletion of the entry the cursor currently points at.
    fn delete_current(&mut self);

    /// Replace the value of the entry the cursor currently points at.
    fn write_current(&mut self, value: &[u8]) -> Result<(), StoreError>;
}
