//! Typed promise attributes
//!
//! The source of truth for what an actuator may be asked to do. Each
//! promise kind carries its own strongly-typed record; the evaluator
//! dispatches on the `PromiseAttrs` variant, so a files actuator can never
//! see process attributes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{DataType, PromiseKind, RVal};

// ============================================================================
// COMMON SUB-RECORDS
// ============================================================================

/// What to do when state diverges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Action {
    /// Converge the state.
    #[default]
    Fix,
    /// Report what would change, change nothing.
    Warn,
}

/// Transaction controls shared by every promise kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub action: Action,
    /// Minimum minutes between attempts on the same lock.
    pub ifelapsed_min: i64,
    /// Minutes after which a held lock is considered stale.
    pub expireafter_min: i64,
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction {
            action: Action::Fix,
            ifelapsed_min: 1,
            expireafter_min: 120,
        }
    }
}

/// Scope requested for outcome classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClassScope {
    Bundle,
    #[default]
    Namespace,
}

/// Classes to define depending on the promise outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DefineClasses {
    pub promise_kept: Vec<String>,
    pub promise_repaired: Vec<String>,
    pub repair_failed: Vec<String>,
    pub scope: ClassScope,
}

impl DefineClasses {
    pub fn is_empty(&self) -> bool {
        self.promise_kept.is_empty()
            && self.promise_repaired.is_empty()
            && self.repair_failed.is_empty()
    }
}

/// Backup policy for files the engine rewrites or moves aside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupOption {
    /// No backup is kept.
    No,
    /// A single backup at the plain backup name.
    Single,
    /// Backup name carries the run timestamp.
    Timestamp,
    /// Numbered rotation keeping the given number of copies.
    Rotate(u32),
}

impl Default for BackupOption {
    fn default() -> Self {
        BackupOption::Single
    }
}

// ============================================================================
// FILES
// ============================================================================

/// Line-ending convention for saved files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NewLineMode {
    #[default]
    Unix,
    Native,
}

/// Defaults applied when a file is loaded and rewritten as an item list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditDefaults {
    pub backup: BackupOption,
    /// Refuse to load files larger than this many bytes.
    pub max_file_size: u64,
    pub newline: NewLineMode,
}

impl Default for EditDefaults {
    fn default() -> Self {
        EditDefaults {
            backup: BackupOption::Single,
            max_file_size: 100 * 1024 * 1024,
            newline: NewLineMode::Unix,
        }
    }
}

/// Attributes of a files promise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileAttrs {
    pub move_obstructions: bool,
    pub backup: BackupOption,
    /// Directory receiving archived backups; `None` leaves them in place.
    pub repository: Option<PathBuf>,
    pub edit: EditDefaults,
    /// Lines the file is promised to contain, in order. When set, the
    /// actuator converges the file to exactly this content.
    pub promised_content: Option<Vec<String>>,
    pub transaction: Transaction,
    pub classes: DefineClasses,
}

// ============================================================================
// PROCESSES
// ============================================================================

/// Inclusive numeric range; `None` bounds never match (the predicate
/// contributes nothing).
pub type Range = Option<(i64, i64)>;

/// Per-attribute selection predicates for the process actuator. Each
/// predicate that holds contributes its field name to the matched set;
/// `process_result` combines the names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessSelect {
    pub owner: Vec<String>,
    pub pid: Range,
    pub ppid: Range,
    pub pgid: Range,
    pub vsize: Range,
    pub rsize: Range,
    pub ttime: Range,
    pub stime: Range,
    pub priority: Range,
    pub threads: Range,
    pub status: Option<String>,
    pub command: Option<String>,
    pub tty: Option<String>,
    /// Boolean expression over predicate names; empty means the
    /// conjunction of every predicate that was specified.
    pub process_result: Option<String>,
}

/// Count assertion over the match set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessCount {
    pub min: i64,
    pub max: i64,
    pub in_range_define: Vec<String>,
    pub out_of_range_define: Vec<String>,
}

/// Attributes of a processes promise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessAttrs {
    pub select: Option<ProcessSelect>,
    pub count: Option<ProcessCount>,
    /// Signal names, bare integers, or `<N>s` sleep elements, in order.
    pub signals: Vec<String>,
    /// Shell command expected to stop the matched processes.
    pub stop: Option<String>,
    /// Class defined when a restart is delegated downstream.
    pub restart_class: Option<String>,
    pub transaction: Transaction,
    pub classes: DefineClasses,
}

// ============================================================================
// STORAGE
// ============================================================================

/// Mount requirements of a storage promise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MountAttrs {
    /// Exported path on the server.
    pub source: Option<String>,
    pub server: Option<String>,
    pub fs_type: String,
    pub options: Vec<String>,
    /// Edit the filesystem table instead of mounting directly; the run
    /// then finishes with one mount-all pass.
    pub edit_fstab: bool,
    pub unmount: bool,
}

/// Volume sanity requirements of a storage promise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttrs {
    /// Include filesystems mounted from foreign devices.
    pub check_foreign: bool,
    /// Negative values name a percentage, positive an absolute byte count.
    pub freespace: Option<i64>,
    pub sensible_size: u64,
    pub sensible_count: u64,
}

impl Default for VolumeAttrs {
    fn default() -> Self {
        VolumeAttrs {
            check_foreign: false,
            freespace: None,
            sensible_size: 1000,
            sensible_count: 2,
        }
    }
}

/// Attributes of a storage promise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageAttrs {
    pub mount: Option<MountAttrs>,
    pub volume: Option<VolumeAttrs>,
    pub transaction: Transaction,
    pub classes: DefineClasses,
}

// ============================================================================
// ACL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AclMethod {
    #[default]
    Append,
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AclFlavor {
    #[default]
    Generic,
    Posix,
    Ntfs,
}

/// Treatment of a directory's default (inherited) ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AclDefault {
    #[default]
    NoChange,
    Access,
    Specify,
    Clear,
}

/// Attributes of an acl promise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AclAttrs {
    pub entries: Vec<String>,
    pub default_entries: Vec<String>,
    pub method: AclMethod,
    pub flavor: AclFlavor,
    pub default: AclDefault,
    pub transaction: Transaction,
    pub classes: DefineClasses,
}

// ============================================================================
// CLASSES AND VARS
// ============================================================================

/// Attributes of a classes promise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassAttrs {
    /// Guard expression; absent means define unconditionally.
    pub expression: Option<String>,
    /// Explicit scope override.
    pub scope: Option<ClassScope>,
    /// Minutes of persistence; zero means not persistent.
    pub persistence_min: i64,
    pub tags: Vec<String>,
}

/// Attributes of a vars promise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarAttrs {
    pub dtype: DataType,
    pub value: RVal,
    pub tags: Vec<String>,
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Typed attribute record, one variant per promise kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PromiseAttrs {
    Files(FileAttrs),
    Processes(ProcessAttrs),
    Storage(StorageAttrs),
    Acl(AclAttrs),
    Classes(ClassAttrs),
    Vars(VarAttrs),
}

impl PromiseAttrs {
    pub fn kind(&self) -> PromiseKind {
        match self {
            PromiseAttrs::Files(_) => PromiseKind::Files,
            PromiseAttrs::Processes(_) => PromiseKind::Processes,
            PromiseAttrs::Storage(_) => PromiseKind::Storage,
            PromiseAttrs::Acl(_) => PromiseKind::Acl,
            PromiseAttrs::Classes(_) => PromiseKind::Classes,
            PromiseAttrs::Vars(_) => PromiseKind::Vars,
        }
    }

    pub fn transaction(&self) -> Transaction {
        match self {
            PromiseAttrs::Files(a) => a.transaction.clone(),
            PromiseAttrs::Processes(a) => a.transaction.clone(),
            PromiseAttrs::Storage(a) => a.transaction.clone(),
            PromiseAttrs::Acl(a) => a.transaction.clone(),
            PromiseAttrs::Classes(_) | PromiseAttrs::Vars(_) => Transaction::default(),
        }
    }

    pub fn classes(&self) -> Option<&DefineClasses> {
        match self {
            PromiseAttrs::Files(a) => Some(&a.classes),
            PromiseAttrs::Processes(a) => Some(&a.classes),
            PromiseAttrs::Storage(a) => Some(&a.classes),
            PromiseAttrs::Acl(a) => Some(&a.classes),
            PromiseAttrs::Classes(_) | PromiseAttrs::Vars(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dispatch() {
        assert_eq!(
            PromiseAttrs::Files(FileAttrs::default()).kind(),
            PromiseKind::Files
        );
        assert_eq!(
            PromiseAttrs::Processes(ProcessAttrs::default()).kind(),
            PromiseKind::Processes
        );
    }

    #[test]
    fn test_transaction_defaults() {
        let t = Transaction::default();
        assert_eq!(t.action, Action::Fix);
        assert_eq!(t.ifelapsed_min, 1);
        assert_eq!(t.expireafter_min, 120);
    }

    #[test]
    fn test_define_classes_empty() {
        assert!(DefineClasses::default().is_empty());
        let c = DefineClasses {
            promise_repaired: vec!["fixed".into()],
            ..Default::default()
        };
        assert!(!c.is_empty());
    }
}
