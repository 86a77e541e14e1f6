//! ACL actuator
//!
//! Validates access-control entries against the per-flavor grammar and
//! hands valid promises to the platform backend. An entry reads
//! `(user|group|all|mask):[id:]mode[:perm_type]`, where `mode` is a
//! comma-separated sequence of `(op)(perms)[<native>]` tuples: `op` is
//! one of `=+-`, `perms` draws from the flavor's permission alphabet, and
//! the bracketed native clause carries extra flavor-specific letters.
//! `deny` permission types and `mask` entries are only legal on flavors
//! that support them.

use std::path::Path;

use pledge_core::{AclAttrs, AclDefault, AclFlavor, ActuatorError, PromiseResult};
use tracing::{debug, error};

/// Operators legal at the start of each mode tuple.
const VALID_OPS: &str = "=+-";
/// Generic permission letters, meaningful on every platform.
const GENERIC_PERMS: &str = "rwx";
/// Native permission letters of the POSIX flavor.
const NATIVE_PERMS_POSIX: &str = "rwx";
/// Native permission letters of the NTFS flavor.
const NATIVE_PERMS_NTFS: &str = "rwxFMo";

/// Per-flavor validation capabilities.
struct FlavorRules {
    native_perms: &'static str,
    deny_support: bool,
    mask_support: bool,
}

fn flavor_rules(flavor: AclFlavor) -> FlavorRules {
    match flavor {
        // Generic entries cannot carry native or deny permissions.
        AclFlavor::Generic => FlavorRules {
            native_perms: "",
            deny_support: false,
            mask_support: false,
        },
        AclFlavor::Posix => FlavorRules {
            native_perms: NATIVE_PERMS_POSIX,
            deny_support: false,
            mask_support: true,
        },
        AclFlavor::Ntfs => FlavorRules {
            native_perms: NATIVE_PERMS_NTFS,
            deny_support: true,
            mask_support: false,
        },
    }
}

/// Platform ACL application; POSIX and NTFS implementations are external
/// collaborators behind this trait.
pub trait AclBackend {
    fn apply(&self, path: &Path, attrs: &AclAttrs) -> Result<PromiseResult, ActuatorError>;
}

/// Validate a whole ACL attribute record against its flavor. The
/// documented defaults (method appends, flavor generic, directories keep
/// their default ACL unchanged) are the `Default` values of the enums, so
/// an unset field already reads as its default here.
pub fn check_acl_syntax(path: &Path, attrs: &AclAttrs) -> Result<(), ActuatorError> {
    let rules = flavor_rules(attrs.flavor);

    // acl_default beyond NoChange only makes sense on directories.
    if attrs.default != AclDefault::NoChange && !path.is_dir() {
        return Err(ActuatorError::Validation {
            reason: "acl_default can only be set on directories".to_string(),
        });
    }

    for entry in attrs.entries.iter().chain(attrs.default_entries.iter()) {
        check_ace_syntax(entry, &rules).map_err(|e| {
            error!(entry = %entry, "the ACL entry contains errors");
            e
        })?;
    }
    Ok(())
}

/// Validate one access-control entry.
fn check_ace_syntax(ace: &str, rules: &FlavorRules) -> Result<(), ActuatorError> {
    let bad = |reason: String| ActuatorError::Validation { reason };

    // Leading entity: user/group take an id, all/mask do not.
    let (rest, needs_id) = if let Some(rest) = ace.strip_prefix("user:") {
        (rest, true)
    } else if let Some(rest) = ace.strip_prefix("group:") {
        (rest, true)
    } else if let Some(rest) = ace.strip_prefix("all:") {
        (rest, false)
    } else if let Some(rest) = ace.strip_prefix("mask:") {
        if !rules.mask_support {
            return Err(bad(format!(
                "this ACL type does not support mask entries: '{ace}'"
            )));
        }
        (rest, false)
    } else {
        return Err(bad(format!(
            "ACL entry '{ace}' does not start with user:/group:/all:"
        )));
    };

    let rest = if needs_id {
        let Some((id, after)) = rest.split_once(':') else {
            return Err(bad(format!("ACL entry '{ace}' is missing the id field")));
        };
        if id.is_empty() {
            return Err(bad(format!("ACL entry '{ace}': id cannot be empty")));
        }
        after
    } else {
        rest
    };

    // Split the optional trailing permission type off the mode.
    let (mode, perm_type) = match rest.rsplit_once(':') {
        Some((mode, pt)) if pt == "allow" || pt == "deny" => (mode, Some(pt)),
        _ => (rest, None),
    };

    if let Some(pt) = perm_type {
        if pt == "deny" && !rules.deny_support {
            return Err(bad(format!(
                "this ACL type does not support deny permissions: '{ace}'"
            )));
        }
    }

    check_mode_syntax(mode, rules)
        .map_err(|e| bad(format!("ACL entry '{ace}': {e}")))
}

/// Validate a mode string: comma-separated `(op)(perms)[<native>]`
/// tuples.
fn check_mode_syntax(mode: &str, rules: &FlavorRules) -> Result<(), String> {
    // An empty mode (e.g. "user:bob:=") legally clears permissions.
    if mode.is_empty() {
        return Ok(());
    }

    for tuple in mode.split(',') {
        let mut chars = tuple.chars().peekable();
        let Some(op) = chars.next() else {
            return Err("empty mode tuple".to_string());
        };
        if !VALID_OPS.contains(op) {
            return Err(format!("invalid operation '{op}' in mode '{mode}'"));
        }

        let mut in_native = false;
        for c in chars {
            match c {
                '[' if !in_native => in_native = true,
                ']' if in_native => in_native = false,
                c if in_native => {
                    if !rules.native_perms.contains(c) {
                        return Err(format!("invalid native permission '{c}' in mode '{mode}'"));
                    }
                }
                c => {
                    if !GENERIC_PERMS.contains(c) {
                        return Err(format!("invalid permission '{c}' in mode '{mode}'"));
                    }
                }
            }
        }
        if in_native {
            return Err(format!("unterminated native clause in mode '{mode}'"));
        }
    }
    Ok(())
}

/// Evaluate one acl promise: validate the entry list, then dispatch to
/// the platform backend. Syntax errors mean the promise could not even be
/// tried.
pub fn verify_acl_promise(
    path: &Path,
    attrs: &AclAttrs,
    backend: &dyn AclBackend,
) -> PromiseResult {
    if let Err(e) = check_acl_syntax(path, attrs) {
        error!(path = %path.display(), error = %e, "syntax error in access control list");
        return PromiseResult::Interrupted;
    }

    debug!(path = %path.display(), flavor = ?attrs.flavor, "dispatching ACL to backend");
    match backend.apply(path, attrs) {
        Ok(result) => result,
        Err(e) => {
            error!(path = %path.display(), error = %e, "ACL backend failed");
            PromiseResult::Fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn posix_attrs(entries: &[&str]) -> AclAttrs {
        AclAttrs {
            entries: entries.iter().map(|e| e.to_string()).collect(),
            flavor: AclFlavor::Posix,
            ..Default::default()
        }
    }

    fn check(entries: &[&str], flavor: AclFlavor) -> Result<(), ActuatorError> {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let attrs = AclAttrs {
            entries: entries.iter().map(|e| e.to_string()).collect(),
            flavor,
            ..Default::default()
        };
        check_acl_syntax(dir.path(), &attrs)
    }

    #[test]
    fn test_valid_entries() {
        assert!(check(&["user:alice:+rw"], AclFlavor::Posix).is_ok());
        assert!(check(&["group:admins:=rwx"], AclFlavor::Posix).is_ok());
        assert!(check(&["all:-w"], AclFlavor::Posix).is_ok());
        assert!(check(&["user:bob:+rw,-x"], AclFlavor::Posix).is_ok());
        assert!(check(&["user:bob:="], AclFlavor::Posix).is_ok());
        assert!(check(&["mask:+rx"], AclFlavor::Posix).is_ok());
        assert!(check(&["user:svc:+rw[rwx]"], AclFlavor::Posix).is_ok());
        assert!(check(&["user:svc:+r[FMo]:deny"], AclFlavor::Ntfs).is_ok());
        assert!(check(&["user:svc:+rw:allow"], AclFlavor::Ntfs).is_ok());
    }

    #[test]
    fn test_invalid_entity() {
        assert!(check(&["nobody:x:+r"], AclFlavor::Posix).is_err());
        assert!(check(&["+rw"], AclFlavor::Posix).is_err());
    }

    #[test]
    fn test_missing_or_empty_id() {
        assert!(check(&["user:+rw"], AclFlavor::Posix).is_err());
        assert!(check(&["user::+rw"], AclFlavor::Posix).is_err());
    }

    #[test]
    fn test_bad_operator_and_perms() {
        assert!(check(&["user:bob:*rw"], AclFlavor::Posix).is_err());
        assert!(check(&["user:bob:+rq"], AclFlavor::Posix).is_err());
        assert!(check(&["user:bob:+rw,zx"], AclFlavor::Posix).is_err());
    }

    #[test]
    fn test_flavor_capabilities() {
        // Deny requires a flavor that supports it.
        assert!(check(&["user:bob:+rw:deny"], AclFlavor::Posix).is_err());
        assert!(check(&["user:bob:+rw:deny"], AclFlavor::Ntfs).is_ok());

        // Mask requires a flavor that supports it.
        assert!(check(&["mask:+r"], AclFlavor::Posix).is_ok());
        assert!(check(&["mask:+r"], AclFlavor::Ntfs).is_err());
        assert!(check(&["mask:+r"], AclFlavor::Generic).is_err());

        // Generic flavor has no native permission alphabet.
        assert!(check(&["user:bob:+rw[r]"], AclFlavor::Generic).is_err());
        // NTFS native letters are not POSIX native letters.
        assert!(check(&["user:bob:+r[F]"], AclFlavor::Posix).is_err());
    }

    #[test]
    fn test_unterminated_native_clause() {
        assert!(check(&["user:bob:+rw[r"], AclFlavor::Posix).is_err());
    }

    #[test]
    fn test_default_entries_validated_too() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let attrs = AclAttrs {
            default_entries: vec!["user:bob:+zz".to_string()],
            flavor: AclFlavor::Posix,
            default: AclDefault::Access,
            ..Default::default()
        };
        assert!(check_acl_syntax(dir.path(), &attrs).is_err());
    }

    #[test]
    fn test_acl_default_requires_directory() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let file = dir.path().join("plain");
        std::fs::write(&file, "x").expect("write should succeed");

        let attrs = AclAttrs {
            default: AclDefault::Access,
            ..Default::default()
        };
        assert!(check_acl_syntax(&file, &attrs).is_err());
        assert!(check_acl_syntax(dir.path(), &attrs).is_ok());
    }

    struct RecordingBackend {
        applied: std::cell::RefCell<usize>,
    }
    impl AclBackend for RecordingBackend {
        fn apply(&self, _path: &Path, _attrs: &AclAttrs) -> Result<PromiseResult, ActuatorError> {
            *self.applied.borrow_mut() += 1;
            Ok(PromiseResult::Change)
        }
    }

    #[test]
    fn test_verify_dispatches_valid_promise() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let backend = RecordingBackend {
            applied: std::cell::RefCell::new(0),
        };
        let attrs = posix_attrs(&["user:alice:+rw"]);
        assert_eq!(
            verify_acl_promise(dir.path(), &attrs, &backend),
            PromiseResult::Change
        );
        assert_eq!(*backend.applied.borrow(), 1);
    }

    #[test]
    fn test_verify_invalid_promise_interrupted() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let backend = RecordingBackend {
            applied: std::cell::RefCell::new(0),
        };
        let attrs = posix_attrs(&["user:alice:!rw"]);
        assert_eq!(
            verify_acl_promise(dir.path(), &attrs, &backend),
            PromiseResult::Interrupted
        );
        assert_eq!(*backend.applied.borrow(), 0, "backend must not see bad ACLs");
    }
}
