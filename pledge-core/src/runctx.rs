//! Per-run context
//!
//! The original implementation kept the policy-server path, the cached
//! start time, the mounted-filesystem list and the "mount everything at
//! the end" flag in process-wide globals. Here they are one explicit
//! context value passed by reference through the evaluator and actuators.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::canonify;

/// Environment override consulted by the test harness to relocate the
/// working directory.
pub const ENV_TEST_OVERRIDE_WORKDIR: &str = "CFENGINE_TEST_OVERRIDE_WORKDIR";

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// Shared state of one policy run.
#[derive(Debug)]
pub struct RunContext {
    workdir: PathBuf,
    state_dir: PathBuf,
    data_dir: PathBuf,
    /// Epoch seconds cached at startup; every backup stamp in one run uses
    /// this value so renamed artifacts sort together.
    start_time: i64,
    /// Canonified local-time rendering of `start_time` for backup names.
    start_stamp: String,
    dry_run: bool,
    interrupted: Arc<AtomicBool>,
    need_mount_all: Cell<bool>,
    mounted_fs: RefCell<Vec<MountEntry>>,
}

impl RunContext {
    /// Create a context rooted at `workdir`, caching the current time as
    /// the run start time.
    pub fn new(workdir: impl Into<PathBuf>, dry_run: bool) -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::with_start_time(workdir, dry_run, start_time)
    }

    /// Create a context with an explicit start time (tests pin this).
    pub fn with_start_time(workdir: impl Into<PathBuf>, dry_run: bool, start_time: i64) -> Self {
        let workdir = workdir.into();
        let state_dir = workdir.join("state");
        let data_dir = workdir.join("data");
        RunContext {
            workdir,
            state_dir,
            data_dir,
            start_time,
            start_stamp: canonify(&format_ctime(start_time)),
            dry_run,
            interrupted: Arc::new(AtomicBool::new(false)),
            need_mount_all: Cell::new(false),
            mounted_fs: RefCell::new(Vec::new()),
        }
    }

    /// Resolve the working directory the way the test harness does: the
    /// explicit override first, then `TEMP`, then the compiled-in default.
    pub fn resolve_workdir(default: &Path) -> PathBuf {
        if let Ok(dir) = std::env::var(ENV_TEST_OVERRIDE_WORKDIR) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("TEMP") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        default.to_path_buf()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// The `_<epoch>_<canonified ctime>` fragment inserted into
    /// timestamped backup names.
    pub fn backup_stamp(&self) -> String {
        format!("_{}_{}", self.start_time, self.start_stamp)
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    /// Mark that the run must finish with one mount-all pass.
    pub fn request_mount_all(&self) {
        self.need_mount_all.set(true);
    }

    pub fn needs_mount_all(&self) -> bool {
        self.need_mount_all.get()
    }

    /// Replace the cached mount table.
    pub fn set_mounted_fs(&self, entries: Vec<MountEntry>) {
        *self.mounted_fs.borrow_mut() = entries;
    }

    pub fn mounted_fs(&self) -> Vec<MountEntry> {
        self.mounted_fs.borrow().clone()
    }

    pub fn mounted_fs_loaded(&self) -> bool {
        !self.mounted_fs.borrow().is_empty()
    }

    /// Find the mount entry for an exact mount point.
    pub fn find_mount(&self, mount_point: &Path) -> Option<MountEntry> {
        self.mounted_fs
            .borrow()
            .iter()
            .find(|e| e.mount_point == mount_point)
            .cloned()
    }
}

/// Render epoch seconds the way `ctime()` does, in local time.
fn format_ctime(epoch: i64) -> String {
    match Local.timestamp_opt(epoch, 0) {
        chrono::LocalResult::Single(t) => t.format("%a %b %e %H:%M:%S %Y").to_string(),
        _ => epoch.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_stamp_shape() {
        let ctx = RunContext::with_start_time("/tmp/wd", false, 1_700_000_000);
        let stamp = ctx.backup_stamp();
        assert!(stamp.starts_with("_1700000000_"));
        // Canonified ctime never contains spaces or colons.
        assert!(!stamp.contains(' '));
        assert!(!stamp.contains(':'));
    }

    #[test]
    fn test_paths() {
        let ctx = RunContext::with_start_time("/var/pledge", false, 0);
        assert_eq!(ctx.state_dir(), Path::new("/var/pledge/state"));
        assert_eq!(ctx.data_dir(), Path::new("/var/pledge/data"));
    }

    #[test]
    fn test_interrupt_flag_shared() {
        let ctx = RunContext::with_start_time("/tmp/wd", false, 0);
        let flag = ctx.interrupt_flag();
        assert!(!ctx.is_interrupted());
        flag.store(true, Ordering::Relaxed);
        assert!(ctx.is_interrupted());
    }

    #[test]
    fn test_mount_table_cache() {
        let ctx = RunContext::with_start_time("/tmp/wd", false, 0);
        assert!(!ctx.mounted_fs_loaded());
        ctx.set_mounted_fs(vec![MountEntry {
            source: "server:/export".into(),
            mount_point: "/mnt/data".into(),
            fs_type: "nfs".into(),
            options: vec!["rw".into()],
        }]);
        assert!(ctx.mounted_fs_loaded());
        let entry = ctx
            .find_mount(Path::new("/mnt/data"))
            .expect("mount entry should be found");
        assert!(entry.has_option("rw"));
        assert!(!ctx.needs_mount_all());
        ctx.request_mount_all();
        assert!(ctx.needs_mount_all());
    }
}
