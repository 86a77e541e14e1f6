//! Remote stat cache
//!
//! Stat responses fetched over the wire are cached for the lifetime of one
//! connection, keyed by `(server, path)`. Negative results are cached too,
//! flagged `failed`, so repeated lookups of a missing remote file cost one
//! round trip instead of many.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File type reported by a remote stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

/// One cached remote stat response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStat {
    pub file_type: RemoteFileType,
    pub mode: u32,
    /// Permissions of the link itself when the entry is a symlink.
    pub link_mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    /// Target when the remote entry is a symlink and a readlink was asked.
    pub readlink: Option<String>,
    /// The remote stat failed; kept so the failure is not re-fetched.
    pub failed: bool,
    /// Whether the query asked about the link rather than its target.
    pub is_link_query: bool,
}

impl RemoteStat {
    /// A cached failure marker.
    pub fn failure(is_link_query: bool) -> Self {
        RemoteStat {
            file_type: RemoteFileType::Regular,
            mode: 0,
            link_mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            ino: 0,
            dev: 0,
            nlink: 0,
            readlink: None,
            failed: true,
            is_link_query,
        }
    }
}

/// Connection-lifetime cache of remote stat responses.
#[derive(Debug, Default)]
pub struct StatCache {
    entries: HashMap<(String, PathBuf), RemoteStat>,
}

impl StatCache {
    pub fn new() -> Self {
        StatCache::default()
    }

    pub fn insert(&mut self, server: &str, path: &Path, stat: RemoteStat) {
        self.entries
            .insert((server.to_string(), path.to_path_buf()), stat);
    }

    pub fn lookup(&self, server: &str, path: &Path) -> Option<&RemoteStat> {
        self.entries.get(&(server.to_string(), path.to_path_buf()))
    }

    pub fn forget(&mut self, server: &str, path: &Path) -> bool {
        self.entries
            .remove(&(server.to_string(), path.to_path_buf()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything; called when the connection closes.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
