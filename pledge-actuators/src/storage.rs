//! Storage actuator
//!
//! Verifies mount-table promises and volume sanity: promised mounts are
//! checked against the live mount table and reconciled either by editing
//! the filesystem table (deferring to one mount-all pass at the end of
//! the run) or by an explicit mount; volumes are walked one level deep to
//! catch suspiciously empty filesystems; free-space thresholds are
//! percentages when negative and absolute bytes otherwise.

use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use pledge_core::{
    Action, ActuatorError, MountAttrs, MountEntry, PromiseResult, RunContext, StorageAttrs,
    VolumeAttrs,
};
use tracing::{debug, error, info, warn};

// ============================================================================
// MOUNT TABLE
// ============================================================================

/// Parse mount-table text in the `/proc/mounts` format: one mount per
/// line, `source mount_point fs_type options ...`.
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(mount_point), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let options = fields
            .next()
            .map(|o| o.split(',').map(str::to_owned).collect())
            .unwrap_or_default();
        entries.push(MountEntry {
            source: source.to_string(),
            mount_point: mount_point.into(),
            fs_type: fs_type.to_string(),
            options,
        });
    }
    entries
}

/// Load the system mount table.
pub fn load_mount_table() -> Result<Vec<MountEntry>, ActuatorError> {
    let text = std::fs::read_to_string("/proc/mounts")?;
    Ok(parse_mount_table(&text))
}

/// Performs the actual (un)mount operations; the system implementation
/// shells out, tests substitute their own.
pub trait MountExec {
    fn mount(&self, entry: &MountEntry) -> Result<bool, ActuatorError>;
    fn unmount(&self, mount_point: &Path) -> Result<bool, ActuatorError>;
    /// Append or correct one line of the filesystem table.
    fn edit_fstab(&self, entry: &MountEntry) -> Result<bool, ActuatorError>;
}

/// `/bin/mount` and `/bin/umount` runner.
pub struct SystemMountExec;

impl MountExec for SystemMountExec {
    fn mount(&self, entry: &MountEntry) -> Result<bool, ActuatorError> {
        let mut cmd = std::process::Command::new("mount");
        cmd.arg("-t").arg(&entry.fs_type);
        if !entry.options.is_empty() {
            cmd.arg("-o").arg(entry.options.join(","));
        }
        cmd.arg(&entry.source).arg(&entry.mount_point);
        Ok(cmd.status()?.success())
    }

    fn unmount(&self, mount_point: &Path) -> Result<bool, ActuatorError> {
        Ok(std::process::Command::new("umount")
            .arg(mount_point)
            .status()?
            .success())
    }

    fn edit_fstab(&self, entry: &MountEntry) -> Result<bool, ActuatorError> {
        use std::io::Write;
        let line = format!(
            "{}\t{}\t{}\t{}\t0 0\n",
            entry.source,
            entry.mount_point.display(),
            entry.fs_type,
            if entry.options.is_empty() {
                "defaults".to_string()
            } else {
                entry.options.join(",")
            }
        );
        let mut fstab = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open("/etc/fstab")?;
        fstab.write_all(line.as_bytes())?;
        Ok(true)
    }
}

// ============================================================================
// FREE SPACE
// ============================================================================

/// Filesystem usage in bytes and percent free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub free_bytes: u64,
    pub free_percent: u8,
}

/// Query free space for the filesystem containing `path`.
pub fn disk_usage(path: &Path) -> Result<DiskUsage, ActuatorError> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
        ActuatorError::Validation {
            reason: format!("path '{}' contains a NUL byte", path.display()),
        }
    })?;

    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let free_bytes = stats.f_bavail as u64 * stats.f_frsize as u64;
    let free_percent = if stats.f_blocks == 0 {
        0
    } else {
        ((stats.f_bavail as u128 * 100) / stats.f_blocks as u128) as u8
    };
    Ok(DiskUsage {
        free_bytes,
        free_percent,
    })
}

/// Whether `dir` sits on a different device than its parent, or appears
/// in the mount table with nfs options. Used to honor `check_foreign`.
pub fn is_foreign_filesystem(ctx: &RunContext, dir: &Path) -> bool {
    if let Some(entry) = ctx.find_mount(dir) {
        if entry.fs_type.contains("nfs") || entry.options.iter().any(|o| o.contains("nfs")) {
            return true;
        }
    }

    let Ok(child) = std::fs::metadata(dir) else {
        return false;
    };
    let Some(parent) = dir.parent() else {
        return false;
    };
    match std::fs::metadata(parent) {
        Ok(parent_md) => parent_md.dev() != child.dev(),
        Err(_) => false,
    }
}

// ============================================================================
// VOLUME AND FREE-SPACE CHECKS
// ============================================================================

/// Walk one level of a directory, reporting suspiciously small volumes.
fn verify_file_system(path: &Path, volume: &VolumeAttrs) -> PromiseResult {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return PromiseResult::Noop,
    };
    if !metadata.is_dir() {
        return PromiseResult::Noop;
    }

    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot open directory for volume check");
            return PromiseResult::Noop;
        }
    };

    let mut file_count: u64 = 0;
    let mut size_bytes: u64 = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        file_count += 1;
        if let Ok(md) = entry.metadata() {
            size_bytes += md.len();
        }
    }

    if size_bytes < volume.sensible_size {
        error!(
            path = %path.display(),
            size_bytes,
            "filesystem is suspiciously small"
        );
        return PromiseResult::Interrupted;
    }
    if file_count < volume.sensible_count {
        error!(
            path = %path.display(),
            file_count,
            "filesystem has suspiciously few files"
        );
        return PromiseResult::Interrupted;
    }

    info!(path = %path.display(), "filesystem content seems sensible as promised");
    PromiseResult::Noop
}

/// Check the free-space threshold: negative names a percentage, positive
/// an absolute byte count.
fn verify_free_space(ctx: &RunContext, path: &Path, volume: &VolumeAttrs) -> PromiseResult {
    let Some(threshold) = volume.freespace else {
        return PromiseResult::Noop;
    };

    if !volume.check_foreign && is_foreign_filesystem(ctx, path) {
        info!(path = %path.display(), "filesystem is mounted from a foreign system, skipping");
        return PromiseResult::Noop;
    }

    let usage = match disk_usage(path) {
        Ok(u) => u,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot stat filesystem for free space");
            return PromiseResult::Noop;
        }
    };

    if threshold < 0 {
        let required = (-threshold) as u8;
        if usage.free_percent < required {
            error!(
                path = %path.display(),
                free = usage.free_percent,
                required,
                "free disk space below promised percentage"
            );
            return PromiseResult::Fail;
        }
    } else if usage.free_bytes < threshold as u64 {
        error!(
            path = %path.display(),
            free_kb = usage.free_bytes / 1024,
            required_kb = threshold / 1024,
            "disk space below promised bytes"
        );
        return PromiseResult::Fail;
    }

    PromiseResult::Noop
}

// ============================================================================
// MOUNT VERIFICATION
// ============================================================================

/// The source string a promised mount should appear with in the table.
fn promised_source(mount: &MountAttrs) -> String {
    match (&mount.server, &mount.source) {
        (Some(server), Some(source)) => format!("{server}:{source}"),
        (None, Some(source)) => source.clone(),
        _ => String::new(),
    }
}

fn verify_mount(
    ctx: &RunContext,
    path: &Path,
    mount: &MountAttrs,
    action: Action,
    exec: &dyn MountExec,
) -> PromiseResult {
    let existing = ctx.find_mount(path);

    if mount.unmount {
        let Some(_) = existing else {
            debug!(path = %path.display(), "unmount promise already kept");
            return PromiseResult::Noop;
        };
        if action == Action::Warn || ctx.dry_run() {
            warn!(path = %path.display(), "need to unmount, but only a warning was promised");
            return PromiseResult::Warn;
        }
        return match exec.unmount(path) {
            Ok(true) => {
                info!(path = %path.display(), "unmounted filesystem");
                PromiseResult::Change
            }
            Ok(false) => {
                error!(path = %path.display(), "unmount command failed");
                PromiseResult::Fail
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "unmount could not run");
                PromiseResult::Fail
            }
        };
    }

    let wanted_source = promised_source(mount);
    if wanted_source.is_empty() {
        error!(
            path = %path.display(),
            "insufficient specification in mount promise, need source and server"
        );
        return PromiseResult::Noop;
    }

    if let Some(entry) = existing {
        if entry.source == wanted_source {
            debug!(path = %path.display(), "mount promise kept");
            return PromiseResult::Noop;
        }
        warn!(
            path = %path.display(),
            mounted = %entry.source,
            promised = %wanted_source,
            "mount source differs from promise"
        );
    }

    if action == Action::Warn || ctx.dry_run() {
        warn!(path = %path.display(), "need to mount, but only a warning was promised");
        return PromiseResult::Warn;
    }

    let entry = MountEntry {
        source: wanted_source,
        mount_point: path.to_path_buf(),
        fs_type: mount.fs_type.clone(),
        options: mount.options.clone(),
    };

    if mount.edit_fstab {
        match exec.edit_fstab(&entry) {
            Ok(true) => {
                // The actual mount happens in one sweep at the end of the
                // run.
                ctx.request_mount_all();
                info!(path = %path.display(), "filesystem table edited, deferring to mount-all");
                PromiseResult::Change
            }
            Ok(false) => PromiseResult::Fail,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot edit the filesystem table");
                PromiseResult::Fail
            }
        }
    } else {
        match exec.mount(&entry) {
            Ok(true) => {
                info!(path = %path.display(), source = %entry.source, "mounted filesystem");
                PromiseResult::Change
            }
            Ok(false) => {
                error!(path = %path.display(), "mount command failed");
                PromiseResult::Fail
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "mount could not run");
                PromiseResult::Fail
            }
        }
    }
}

/// Evaluate one storage promise against a concrete path.
pub fn verify_storage_promise(
    ctx: &RunContext,
    path: &Path,
    attrs: &StorageAttrs,
    exec: &dyn MountExec,
) -> PromiseResult {
    let mut result = PromiseResult::Noop;

    if let Some(mount) = &attrs.mount {
        if mount.unmount && (mount.source.is_some() || mount.server.is_some()) {
            debug!(
                path = %path.display(),
                "an unmount promise carries mount-source information, probably an error"
            );
        }

        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            error!(path = %path.display(), "mount operations require root");
            result.update(PromiseResult::Fail);
        } else {
            if !ctx.mounted_fs_loaded() {
                match load_mount_table() {
                    Ok(entries) => ctx.set_mounted_fs(entries),
                    Err(e) => {
                        error!(error = %e, "cannot obtain the list of mounted filesystems");
                        return PromiseResult::Noop;
                    }
                }
            }
            result.update(verify_mount(ctx, path, mount, attrs.transaction.action, exec));
        }
    }

    if let Some(volume) = &attrs.volume {
        result.update(verify_file_system(path, volume));
        if volume.freespace.is_some() {
            result.update(verify_free_space(ctx, path, volume));
        }
    }

    result
}
